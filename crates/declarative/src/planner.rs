//! Plan walk - refreshes prior objects and diffs them against configuration

use crate::addrs::{AbsResourceInstance, DeposedKey, OutputAddr, ProviderConfigAddr};
use crate::conditions::{ConditionKind, evaluate_conditions};
use crate::config::Config;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::diff::{ResourceDiff, diff_destroy, diff_resource, values_equal};
use crate::error::Result;
use crate::executor::{NodeResult, walk};
use crate::graph::{Graph, NodeKind, ObjectRef, Phase, ResourceNode};
use crate::hooks::{Hooks, StopHandle};
use crate::provider::{
    Provider, ProviderFactories, ReadDataSourceRequest, ReadResourceRequest,
};
use crate::reconcile::refresh_dependencies;
use crate::schema::{BlockSchema, Schemas};
use crate::state::{ResourceInstanceObject, State};
use crate::types::{
    Action, ChangeReason, Changes, OutputChange, Plan, PlanMode, PlanOpts, ResourceInstanceChange,
};
use crate::walk::{WalkContext, lock};
use std::sync::Mutex;
use valuekit::{MarkedValue, Path, PathSet, Value};

/// Computed attributes the configuration leaves null become unknown
fn unknown_computed(schema: Option<&BlockSchema>, mut value: Value) -> Value {
    let Some(schema) = schema else {
        return value;
    };
    for (name, attr) in &schema.attributes {
        let path = Path::root().key(name.as_str());
        if attr.computed && value.get(&path).is_none_or(Value::is_null) {
            let _ = value.set(&path, Value::Unknown);
        }
    }
    value
}

pub(crate) struct Planner<'a> {
    ctx: WalkContext<'a>,
    opts: &'a PlanOpts,
    prev_run_state: State,
    changes: Mutex<Vec<ResourceInstanceChange>>,
}

impl<'a> Planner<'a> {
    pub fn new(
        config: &'a Config,
        schemas: &'a Schemas,
        factories: &'a ProviderFactories,
        hooks: &'a Hooks,
        state: &State,
        opts: &'a PlanOpts,
    ) -> Self {
        Self {
            ctx: WalkContext::new(config, schemas, factories, hooks, state.clone()),
            opts,
            prev_run_state: state.clone(),
            changes: Mutex::new(Vec::new()),
        }
    }

    /// Walk `graph` and collect the plan
    pub fn run(self, graph: &Graph, parallelism: usize, stop: &StopHandle) -> Result<Plan> {
        log::info!("planning {} nodes ({:?} mode)", graph.len(), self.opts.mode);
        let report = walk(graph, parallelism, stop, self.ctx.hooks, |node| self.visit(node))?;
        let diagnostics = report.diagnostics;

        let targeted = !self.opts.targets.is_empty();
        if !targeted {
            self.remove_orphan_data();
        }

        let mut changes = Changes {
            resources: std::mem::take(&mut *lock(&self.changes)),
            outputs: self.output_changes(targeted),
        };
        changes.sort();

        let prior_state = self.ctx.state.snapshot();
        if diagnostics.has_errors() {
            log::warn!("planning finished with errors");
        } else {
            log::info!("planned {} resource changes", changes.actionable().count());
        }
        Ok(Plan {
            mode: self.opts.mode,
            changes,
            prior_state,
            prev_run_state: self.prev_run_state,
            targeted,
            diagnostics,
        })
    }

    fn visit(&self, node: &NodeKind) -> NodeResult {
        match node {
            NodeKind::ProviderConfig(addr) => self.ctx.visit_provider(addr),
            NodeKind::Output(addr) => self.ctx.visit_output(addr),
            NodeKind::DataSource { addr, provider } => self.plan_data(addr, provider),
            NodeKind::Resource(r) => match r.phase {
                Phase::Plan => self.plan_resource(r),
                Phase::PlanDestroy => self.plan_destroy(r),
                Phase::Apply | Phase::ApplyDestroy => NodeResult::ok(),
            },
        }
    }

    fn record(&self, change: ResourceInstanceChange) {
        lock(&self.changes).push(change);
    }

    fn has_pending_change(&self, addr: &AbsResourceInstance) -> bool {
        let deps = self.ctx.config.dependencies_of(addr);
        lock(&self.changes)
            .iter()
            .any(|c| c.action.is_change() && deps.iter().any(|d| d.contains(&c.addr)))
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Refresh the current or a deposed object of `addr` in the working
    /// state. Returns `None` if there is no object or it is gone.
    fn refresh(
        &self,
        provider: &dyn Provider,
        addr: &AbsResourceInstance,
        provider_addr: &ProviderConfigAddr,
        deposed: Option<&DeposedKey>,
    ) -> std::result::Result<Option<ResourceInstanceObject>, Diagnostic> {
        let prior = {
            let state = self.ctx.state.lock();
            match deposed {
                Some(key) => state.deposed(addr, key).cloned(),
                None => state.current(addr).cloned(),
            }
        };
        let Some(prior) = prior else {
            return Ok(None);
        };
        if self.opts.skip_refresh {
            return Ok(Some(prior));
        }

        self.ctx.hooks.pre_refresh(addr, deposed);
        let resp = provider
            .read_resource(ReadResourceRequest {
                type_name: addr.resource.type_name.clone(),
                prior: prior.value.clone(),
                private: prior.private.clone(),
            })
            .map_err(|e| Diagnostic::provider("read", &e).with_subject(addr))?;
        self.ctx.hooks.post_refresh(addr, deposed, resp.new_state.as_ref());

        let Some(value) = resp.new_state else {
            log::info!("{addr} no longer exists");
            self.ctx.state.with(|s| match deposed {
                Some(key) => {
                    s.remove_deposed(addr, key);
                }
                None => {
                    s.remove_current(addr);
                }
            });
            return Ok(None);
        };

        let mut refreshed = ResourceInstanceObject {
            value,
            private: resp.private,
            ..prior
        };
        refreshed.normalize_marks();
        self.ctx.state.with(|s| match deposed {
            Some(key) => s.set_deposed(addr, key.clone(), refreshed.clone(), provider_addr),
            None => s.set_current(addr, refreshed.clone(), provider_addr),
        });
        Ok(Some(refreshed))
    }

    // ========================================================================
    // Managed resources
    // ========================================================================

    fn plan_resource(&self, node: &ResourceNode) -> NodeResult {
        let addr = &node.addr;
        let Some(rc) = self.ctx.config.resource(addr) else {
            return NodeResult::ok();
        };
        let provider = match self.ctx.provider(&node.provider) {
            Ok(p) => p,
            Err(diag) => return NodeResult::failed(diag),
        };
        let prior = match self.refresh(provider.as_ref(), addr, &node.provider, None) {
            Ok(prior) => prior,
            Err(diag) => return NodeResult::failed(diag),
        };
        if self.opts.mode == PlanMode::RefreshOnly {
            return NodeResult::ok();
        }

        let subject = addr.to_string();
        let mut diags = Diagnostics::new();
        let pre = evaluate_conditions(
            ConditionKind::Precondition,
            &rc.lifecycle.preconditions,
            &self.ctx.evaluator(),
            &subject,
            true,
        );
        diags.extend(pre.diagnostics);
        if !pre.pass {
            return NodeResult::from_diagnostics(diags);
        }

        let config = match self.ctx.eval_resource(rc) {
            Ok(v) => v,
            Err(diag) => {
                diags.push(diag);
                return NodeResult::from_diagnostics(diags);
            }
        };
        let schema = self.ctx.resource_schema_or_default(&node.provider, addr);

        self.ctx.hooks.pre_diff(addr, None);
        let (change, diff_diags) = diff_resource(
            provider.as_ref(),
            &ResourceDiff {
                addr,
                provider: &node.provider,
                schema: &schema,
                lifecycle: &rc.lifecycle,
                prior: prior.as_ref(),
                config: &config,
            },
        );
        diags.extend(diff_diags);
        let Some(change) = change else {
            return NodeResult::from_diagnostics(diags);
        };
        self.ctx.hooks.post_diff(&change);

        let planned = MarkedValue::new(
            change.after.clone().unwrap_or_default(),
            change.after_sensitive.clone(),
        );
        self.ctx.set_planned(addr, planned.clone());

        let post = evaluate_conditions(
            ConditionKind::Postcondition,
            &rc.lifecycle.postconditions,
            &self.ctx.evaluator().with_self(&planned),
            &subject,
            true,
        );
        diags.extend(post.diagnostics);

        if change.action == Action::NoOp {
            self.ctx
                .state
                .with(|s| refresh_dependencies(s, self.ctx.config, addr));
        }
        self.record(change);
        NodeResult::from_diagnostics(diags)
    }

    fn plan_destroy(&self, node: &ResourceNode) -> NodeResult {
        let addr = &node.addr;
        let deposed = match &node.object {
            ObjectRef::Current => None,
            ObjectRef::Deposed(key) => Some(key),
            ObjectRef::Replaced => return NodeResult::ok(),
        };
        let provider = match self.ctx.provider(&node.provider) {
            Ok(p) => p,
            Err(diag) => return NodeResult::failed(diag),
        };
        let prior = match self.refresh(provider.as_ref(), addr, &node.provider, deposed) {
            Ok(Some(prior)) => prior,
            Ok(None) => return NodeResult::ok(),
            Err(diag) => return NodeResult::failed(diag),
        };
        if self.opts.mode == PlanMode::RefreshOnly {
            return NodeResult::ok();
        }

        let configured = self.ctx.config.resource(addr);
        let reason = match (deposed, self.opts.mode) {
            (Some(_), _) => ChangeReason::Deposed,
            (None, PlanMode::Destroy) => ChangeReason::DestroyMode,
            (None, _) => ChangeReason::NoConfiguration,
        };
        if deposed.is_none() && configured.is_some() {
            self.ctx
                .state
                .with(|s| refresh_dependencies(s, self.ctx.config, addr));
        }
        let prevent = configured.is_some_and(|rc| rc.lifecycle.prevent_destroy);

        self.ctx.hooks.pre_diff(addr, deposed);
        let (change, diags) = diff_destroy(
            provider.as_ref(),
            addr,
            &node.provider,
            deposed,
            &prior,
            self.ctx.resource_schema(&node.provider, addr),
            reason,
            prevent,
        );
        if let Some(change) = change {
            self.ctx.hooks.post_diff(&change);
            self.record(change);
        }
        NodeResult::from_diagnostics(diags)
    }

    // ========================================================================
    // Data sources
    // ========================================================================

    fn plan_data(
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
        let schema_marks = schema.map(BlockSchema::sensitive_paths).unwrap_or_default();
        let mut marks = marks.union(&schema_marks);

        let pending = self.opts.mode != PlanMode::Destroy && self.has_pending_change(addr);
        if !value.is_wholly_known() || pending {
            log::debug!("deferring read of {addr} to apply");
            let after = unknown_computed(schema, value);
            marks.retain_present(&after);
            let before = self.ctx.state.lock().current(addr).map(|o| o.value.clone());
            self.ctx.set_planned(addr, MarkedValue::new(after.clone(), marks.clone()));
            self.record(ResourceInstanceChange {
                addr: addr.clone(),
                deposed: None,
                provider: provider_addr.clone(),
                action: Action::Read,
                reason: None,
                before,
                after: Some(after),
                before_sensitive: PathSet::new(),
                after_sensitive: marks,
                private: Vec::new(),
                requires_replace: Vec::new(),
            });
            return NodeResult::ok();
        }

        let provider = match self.ctx.provider(provider_addr) {
            Ok(p) => p,
            Err(diag) => return NodeResult::failed(diag),
        };
        self.ctx.hooks.pre_refresh(addr, None);
        let state = match provider.read_data_source(ReadDataSourceRequest {
            type_name: addr.resource.type_name.clone(),
            config: value,
        }) {
            Ok(resp) => resp.state,
            Err(e) => {
                let diag = Diagnostic::provider("read data source", &e).with_subject(addr);
                return NodeResult::failed(diag);
            }
        };
        self.ctx.hooks.post_refresh(addr, None, Some(&state));
        if !state.is_wholly_known() {
            return NodeResult::failed(
                Diagnostic::error(
                    DiagnosticKind::InvalidResult,
                    "Provider produced invalid object",
                    format!("The provider returned unknown values when reading {addr}"),
                )
                .with_subject(addr),
            );
        }

        log::debug!("read {addr}");
        let object = ResourceInstanceObject::new(state).with_sensitive_paths(marks);
        self.ctx.state.with(|s| s.set_current(addr, object, provider_addr));
        NodeResult::ok()
    }

    fn remove_orphan_data(&self) {
        self.ctx.state.with(|s| {
            let orphans: Vec<AbsResourceInstance> = s
                .instances()
                .filter(|e| e.addr.is_data() && self.ctx.config.resource(&e.addr).is_none())
                .map(|e| e.addr)
                .collect();
            for addr in orphans {
                log::debug!("dropping {addr}, no longer configured");
                s.remove_current(&addr);
            }
        });
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    fn output_changes(&self, targeted: bool) -> Vec<OutputChange> {
        let prior = &self.prev_run_state;
        let mut changes = Vec::new();

        if self.opts.mode == PlanMode::Destroy {
            for (name, value) in prior.root_outputs() {
                changes.push(OutputChange {
                    addr: OutputAddr::root(name.clone()),
                    action: Action::Delete,
                    before: Some(value.value.clone()),
                    after: None,
                    sensitive: value.sensitive,
                });
            }
            return changes;
        }

        for (addr, oc) in &self.ctx.config.outputs {
            if !addr.module.is_root() {
                continue;
            }
            let Some(after) = self.ctx.output(addr) else {
                continue;
            };
            let before = prior.output(addr);
            let action = match (before, after.value.is_null()) {
                (None, true) => continue,
                (None, false) => Action::Create,
                (Some(_), true) => Action::Delete,
                (Some(b), false) if values_equal(&b.value, &after.value) => Action::NoOp,
                (Some(_), false) => Action::Update,
            };
            changes.push(OutputChange {
                addr: addr.clone(),
                action,
                before: before.map(|b| b.value.clone()),
                after: (!after.value.is_null()).then(|| after.value.clone()),
                sensitive: oc.sensitive || !after.marks.is_empty(),
            });
        }

        if !targeted {
            for (name, value) in prior.root_outputs() {
                let addr = OutputAddr::root(name.clone());
                if self.ctx.config.output(&addr).is_none() {
                    changes.push(OutputChange {
                        addr,
                        action: Action::Delete,
                        before: Some(value.value.clone()),
                        after: None,
                        sensitive: value.sensitive,
                    });
                }
            }
        }
        changes
    }
}
