//! Apply walk - carries out a plan's changes and records the results

use crate::addrs::{AbsResourceInstance, DeposedKey, ProviderConfigAddr};
use crate::conditions::{ConditionKind, evaluate_conditions};
use crate::config::{Config, ResourceConfig};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::Result;
use crate::executor::{NodeResult, NodeStatus, WalkReport, walk};
use crate::graph::{Graph, NodeKind, ObjectRef, Phase, ResourceNode};
use crate::hooks::{Hooks, StopHandle};
use crate::provider::{
    ApplyResourceChangeRequest, ApplyResourceChangeResponse, Provider, ProviderFactories,
    ReadDataSourceRequest,
};
use crate::reconcile::{
    StateEffect, commit, finish_destroy, is_complete, output_effect, realized_object,
    tainted_object,
};
use crate::schema::Schemas;
use crate::state::ResourceInstanceObject;
use crate::types::{Action, ApplyOutcome, ApplySummary, Plan, PlanMode, ReplaceOrder};
use crate::walk::{WalkContext, lock};
use std::collections::HashMap;
use std::sync::Mutex;
use valuekit::{MarkedValue, Value};

/// Null leaves of the configuration become unknown, so filling a planned
/// value from it never overwrites what the provider is meant to compute
fn nulls_as_unknown(value: &Value) -> Value {
    match value {
        Value::Null => Value::Unknown,
        Value::Object(attrs) => Value::Object(
            attrs
                .iter()
                .map(|(k, v)| (k.clone(), nulls_as_unknown(v)))
                .collect(),
        ),
        Value::List(items) => Value::List(items.iter().map(nulls_as_unknown).collect()),
        other => other.clone(),
    }
}

fn invalid_object(addr: &AbsResourceInstance, detail: impl Into<String>) -> Diagnostic {
    Diagnostic::error(
        DiagnosticKind::InvalidResult,
        "Provider produced inconsistent result",
        detail,
    )
    .with_subject(addr)
}

pub(crate) struct Applier<'a> {
    ctx: WalkContext<'a>,
    plan: &'a Plan,
    /// Deposed keys of create-before-destroy originals, by instance
    replaced: Mutex<HashMap<AbsResourceInstance, DeposedKey>>,
}

impl<'a> Applier<'a> {
    pub fn new(
        config: &'a Config,
        schemas: &'a Schemas,
        factories: &'a ProviderFactories,
        hooks: &'a Hooks,
        plan: &'a Plan,
    ) -> Self {
        Self {
            ctx: WalkContext::new(config, schemas, factories, hooks, plan.prior_state.clone()),
            plan,
            replaced: Mutex::new(HashMap::new()),
        }
    }

    /// Walk `graph` and return the resulting state
    pub fn run(self, graph: &Graph, parallelism: usize, stop: &StopHandle) -> Result<ApplyOutcome> {
        log::info!("applying {} nodes", graph.len());
        let report = walk(graph, parallelism, stop, self.ctx.hooks, |node| self.visit(node))?;
        let summary = self.summarize(&report);

        self.ctx.state.with(|s| {
            for change in &self.plan.changes.outputs {
                if change.action == Action::Delete && change.addr.module.is_root() {
                    s.remove_output(&change.addr);
                }
            }
            if self.plan.mode == PlanMode::Destroy {
                finish_destroy(s);
            }
        });

        if report.diagnostics.has_errors() {
            log::warn!("apply finished with errors ({} failed)", summary.failed);
        } else {
            log::info!("apply complete: {} changes", summary.total_changes());
        }
        Ok(ApplyOutcome {
            state: self.ctx.state.into_inner(),
            diagnostics: report.diagnostics,
            summary,
        })
    }

    fn visit(&self, node: &NodeKind) -> NodeResult {
        match node {
            NodeKind::ProviderConfig(addr) => self.ctx.visit_provider(addr),
            NodeKind::Output(addr) => {
                let result = self.ctx.visit_output(addr);
                if addr.module.is_root() && !result.is_failed() {
                    let declared = self.ctx.config.output(addr);
                    if let (Some(value), Some(oc)) = (self.ctx.output(addr), declared) {
                        commit(&self.ctx.state, [output_effect(addr, &value, oc.sensitive)]);
                    }
                }
                result
            }
            NodeKind::DataSource { addr, provider } => self.read_data(addr, provider),
            NodeKind::Resource(r) => match r.phase {
                Phase::Apply => self.apply_resource(r),
                Phase::ApplyDestroy => self.apply_destroy(r),
                Phase::Plan | Phase::PlanDestroy => NodeResult::ok(),
            },
        }
    }

    fn summarize(&self, report: &WalkReport) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for (node, status) in &report.statuses {
            if node.resource_addr().is_none() {
                continue;
            }
            match status {
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::Succeeded => match node {
                    NodeKind::Resource(r) if r.phase == Phase::Apply => {
                        if let Some(change) = self.plan.changes.resource(&r.addr, None) {
                            summary.add_action(change.action);
                        }
                    }
                    NodeKind::Resource(r) if r.object != ObjectRef::Replaced => {
                        summary.add_action(Action::Delete);
                    }
                    NodeKind::DataSource { .. } => summary.add_action(Action::Read),
                    _ => {}
                },
                _ => {}
            }
        }
        summary
    }

    fn call_apply(
        &self,
        provider: &dyn Provider,
        addr: &AbsResourceInstance,
        req: ApplyResourceChangeRequest,
    ) -> std::result::Result<ApplyResourceChangeResponse, Diagnostic> {
        provider
            .apply_resource_change(req)
            .map_err(|e| Diagnostic::provider("apply", &e).with_subject(addr))
    }

    fn check_conditions(
        &self,
        kind: ConditionKind,
        rc: &ResourceConfig,
        self_value: Option<&MarkedValue>,
    ) -> Diagnostics {
        let conditions = match kind {
            ConditionKind::Precondition => &rc.lifecycle.preconditions,
            ConditionKind::Postcondition => &rc.lifecycle.postconditions,
        };
        if conditions.is_empty() {
            return Diagnostics::new();
        }
        let eval = match self_value {
            Some(v) => self.ctx.evaluator().with_self(v),
            None => self.ctx.evaluator(),
        };
        evaluate_conditions(kind, conditions, &eval, &rc.addr.to_string(), false).diagnostics
    }

    // ========================================================================
    // Create, update, replace
    // ========================================================================

    fn apply_resource(&self, node: &ResourceNode) -> NodeResult {
        let addr = &node.addr;
        let Some(change) = self.plan.changes.resource(addr, None) else {
            return NodeResult::ok();
        };
        let Some(rc) = self.ctx.config.resource(addr) else {
            return NodeResult::failed(
                Diagnostic::error(
                    DiagnosticKind::Configuration,
                    "Resource not configured",
                    format!(
                        "The plan has a {} change for {addr}, which is not in the configuration",
                        change.action
                    ),
                )
                .with_subject(addr),
            );
        };

        if change.action == Action::NoOp {
            let mut diags = self.check_conditions(ConditionKind::Precondition, rc, None);
            let current = self
                .ctx
                .state
                .lock()
                .current(addr)
                .map(ResourceInstanceObject::marked_value);
            if let Some(current) = current {
                let post = self.check_conditions(ConditionKind::Postcondition, rc, Some(&current));
                diags.extend(post);
            }
            return NodeResult::from_diagnostics(diags);
        }

        let provider = match self.ctx.provider(&node.provider) {
            Ok(p) => p,
            Err(diag) => return NodeResult::failed(diag),
        };
        let pre = self.check_conditions(ConditionKind::Precondition, rc, None);
        if pre.has_errors() {
            return NodeResult::from_diagnostics(pre);
        }
        let config = match self.ctx.eval_resource(rc) {
            Ok(v) => v,
            Err(diag) => return NodeResult::failed(diag),
        };
        let schema = self.ctx.resource_schema_or_default(&node.provider, addr);
        let config_value = schema.normalize(config.value.clone());
        let planned = change
            .after
            .clone()
            .unwrap_or_default()
            .fill_unknowns_from(&nulls_as_unknown(&config_value));
        let marks = change
            .after_sensitive
            .union(&config.marks)
            .union(&schema.sensitive_paths());

        let prior = self.ctx.state.lock().current(addr).cloned();
        self.ctx.hooks.pre_apply(addr, None, change.action);

        let mut effects = Vec::new();
        let prior_value = match change.action {
            Action::Replace(ReplaceOrder::DeleteThenCreate) => {
                if let Some(prior) = &prior {
                    let req = ApplyResourceChangeRequest {
                        type_name: addr.resource.type_name.clone(),
                        prior: Some(prior.value.clone()),
                        planned: None,
                        config: None,
                        planned_private: prior.private.clone(),
                    };
                    if let Err(diag) = self.call_apply(provider.as_ref(), addr, req) {
                        self.ctx.hooks.post_apply(addr, None, Some(&diag.detail));
                        return NodeResult::failed(diag);
                    }
                    log::debug!("destroyed {addr} ahead of its replacement");
                    commit(&self.ctx.state, [StateEffect::RemoveCurrent { addr: addr.clone() }]);
                }
                None
            }
            Action::Replace(ReplaceOrder::CreateThenDelete) => {
                if prior.is_some() {
                    let key = DeposedKey::generate();
                    lock(&self.replaced).insert(addr.clone(), key.clone());
                    effects.push(StateEffect::DeposeCurrent {
                        addr: addr.clone(),
                        key,
                    });
                }
                None
            }
            Action::Create => None,
            _ => prior.as_ref().map(|p| p.value.clone()),
        };

        let req = ApplyResourceChangeRequest {
            type_name: addr.resource.type_name.clone(),
            prior: prior_value,
            planned: Some(planned),
            config: Some(config_value),
            planned_private: change.private.clone(),
        };
        let resp = match self.call_apply(provider.as_ref(), addr, req) {
            Ok(resp) => resp,
            Err(diag) => {
                lock(&self.replaced).remove(addr);
                self.ctx.hooks.post_apply(addr, None, Some(&diag.detail));
                return NodeResult::failed(diag);
            }
        };
        let Some(new_value) = resp.new_state else {
            lock(&self.replaced).remove(addr);
            let diag = invalid_object(
                addr,
                format!(
                    "The provider returned no object after applying the {} of {addr}",
                    change.action
                ),
            );
            self.ctx.hooks.post_apply(addr, None, Some(&diag.detail));
            return NodeResult::failed(diag);
        };

        let dependencies = self.ctx.config.dependencies_of(addr);
        let object = realized_object(
            MarkedValue::new(new_value, marks),
            dependencies,
            resp.private,
            rc.lifecycle.create_before_destroy,
        );
        let mut diags = Diagnostics::new();
        let object = if is_complete(&object.value) {
            object
        } else {
            diags.push(invalid_object(
                addr,
                format!(
                    "The provider left unknown values in the new state of {addr}; \
                     it is recorded as tainted"
                ),
            ));
            tainted_object(object)
        };
        let stored = object.marked_value();
        effects.push(StateEffect::SetCurrent {
            addr: addr.clone(),
            provider: node.provider.clone(),
            object,
        });
        commit(&self.ctx.state, effects);
        log::info!("{addr}: {} complete", change.action);
        self.ctx.hooks.post_apply(addr, None, None);

        diags.extend(self.check_conditions(ConditionKind::Postcondition, rc, Some(&stored)));
        NodeResult::from_diagnostics(diags)
    }

    // ========================================================================
    // Destroy
    // ========================================================================

    fn apply_destroy(&self, node: &ResourceNode) -> NodeResult {
        let addr = &node.addr;
        let (key, change) = match &node.object {
            ObjectRef::Current => (None, self.plan.changes.resource(addr, None)),
            ObjectRef::Deposed(key) => {
                (Some(key.clone()), self.plan.changes.resource(addr, Some(key)))
            }
            ObjectRef::Replaced => match lock(&self.replaced).get(addr) {
                Some(key) => (Some(key.clone()), None),
                None => return NodeResult::ok(),
            },
        };
        let object = {
            let state = self.ctx.state.lock();
            match &key {
                Some(k) => state.deposed(addr, k).cloned(),
                None => state.current(addr).cloned(),
            }
        };
        let Some(object) = object else {
            log::debug!("{addr} is already gone");
            return NodeResult::ok();
        };

        let provider = match self.ctx.provider(&node.provider) {
            Ok(p) => p,
            Err(diag) => return NodeResult::failed(diag),
        };
        self.ctx.hooks.pre_apply(addr, key.as_ref(), Action::Delete);
        let req = ApplyResourceChangeRequest {
            type_name: addr.resource.type_name.clone(),
            prior: Some(object.value.clone()),
            planned: None,
            config: None,
            planned_private: change.map_or_else(|| object.private.clone(), |c| c.private.clone()),
        };
        let resp = match self.call_apply(provider.as_ref(), addr, req) {
            Ok(resp) => resp,
            Err(diag) => {
                self.ctx.hooks.post_apply(addr, key.as_ref(), Some(&diag.detail));
                return NodeResult::failed(diag);
            }
        };
        if resp.new_state.as_ref().is_some_and(|v| !v.is_null()) {
            let diag = invalid_object(
                addr,
                format!("The provider returned an object after destroying {addr}"),
            );
            self.ctx.hooks.post_apply(addr, key.as_ref(), Some(&diag.detail));
            return NodeResult::failed(diag);
        }

        let effect = match key.clone() {
            Some(key) => StateEffect::RemoveDeposed {
                addr: addr.clone(),
                key,
            },
            None => StateEffect::RemoveCurrent { addr: addr.clone() },
        };
        commit(&self.ctx.state, [effect]);
        log::info!("{addr}: destroyed");
        self.ctx.hooks.post_apply(addr, key.as_ref(), None);
        NodeResult::ok()
    }

    // ========================================================================
    // Deferred data reads
    // ========================================================================

    fn read_data(
        &self,
        addr: &AbsResourceInstance,
        provider_addr: &ProviderConfigAddr,
    ) -> NodeResult {
        let Some(rc) = self.ctx.config.resource(addr) else {
            return NodeResult::ok();
        };
        let config = match self.ctx.eval_resource(rc) {
            Ok(v) => v,
            Err(diag) => return NodeResult::failed(diag),
        };
        let schema = self.ctx.resource_schema(provider_addr, addr);
        let (value, marks) = config.into_parts();
        let value = match schema {
            Some(s) => s.normalize(value),
            None => value,
        };
        if !value.is_wholly_known() {
            return NodeResult::failed(
                Diagnostic::error(
                    DiagnosticKind::Evaluation,
                    "Invalid data source configuration",
                    format!("The configuration of {addr} still has unknown values at apply time"),
                )
                .with_subject(addr),
            );
        }

        let provider = match self.ctx.provider(provider_addr) {
            Ok(p) => p,
            Err(diag) => return NodeResult::failed(diag),
        };
        self.ctx.hooks.pre_apply(addr, None, Action::Read);
        let state = match provider.read_data_source(ReadDataSourceRequest {
            type_name: addr.resource.type_name.clone(),
            config: value,
        }) {
            Ok(resp) => resp.state,
            Err(e) => {
                let diag = Diagnostic::provider("read data source", &e).with_subject(addr);
                self.ctx.hooks.post_apply(addr, None, Some(&diag.detail));
                return NodeResult::failed(diag);
            }
        };
        if !state.is_wholly_known() {
            let diag = invalid_object(
                addr,
                format!("The provider returned unknown values when reading {addr}"),
            );
            self.ctx.hooks.post_apply(addr, None, Some(&diag.detail));
            return NodeResult::failed(diag);
        }

        let marks = match schema {
            Some(s) => marks.union(&s.sensitive_paths()),
            None => marks,
        };
        let object = realized_object(
            MarkedValue::new(state, marks),
            Default::default(),
            Vec::new(),
            false,
        );
        commit(
            &self.ctx.state,
            [StateEffect::SetCurrent {
                addr: addr.clone(),
                provider: provider_addr.clone(),
                object,
            }],
        );
        self.ctx.hooks.post_apply(addr, None, None);
        NodeResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_nulls_never_fill_planned_unknowns() {
        let planned = Value::object([
            ("id", Value::Unknown),
            ("value", Value::Unknown),
            ("tags", Value::list([Value::Unknown])),
        ]);
        let config = Value::object([
            ("id", Value::Null),
            ("value", Value::string("now known")),
            ("tags", Value::list([Value::string("t")])),
        ]);
        let filled = planned.fill_unknowns_from(&nulls_as_unknown(&config));
        assert!(filled.attr("id").unwrap().is_unknown());
        assert_eq!(filled.attr("value"), Some(&Value::string("now known")));
        assert_eq!(filled.attr("tags"), Some(&Value::list([Value::string("t")])));
    }
}
