//! Shared per-operation walk context
//!
//! Holds what every node of a plan or apply walk reads and writes: the
//! working state, values planned so far, module output values and the
//! configured provider instances. Reference evaluation goes through here.

use crate::addrs::{AbsResourceInstance, InstanceKey, OutputAddr, ProviderConfigAddr, VariableAddr};
use crate::config::{Config, ResourceConfig};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::eval::{Evaluator, Scope};
use crate::executor::NodeResult;
use crate::hooks::Hooks;
use crate::provider::{Provider, ProviderFactories, ProviderInstances};
use crate::schema::{BlockSchema, Schemas};
use crate::state::{State, SyncState};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use valuekit::{MarkedValue, Path, PathSet, Value};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct WalkContext<'a> {
    pub config: &'a Config,
    pub schemas: &'a Schemas,
    pub hooks: &'a Hooks,
    pub providers: ProviderInstances<'a>,
    /// Refreshed state while planning, realized state while applying
    pub state: SyncState,
    /// Values planned in this walk, which may still contain unknowns
    planned: Mutex<HashMap<AbsResourceInstance, MarkedValue>>,
    outputs: Mutex<BTreeMap<OutputAddr, MarkedValue>>,
}

impl<'a> WalkContext<'a> {
    pub fn new(
        config: &'a Config,
        schemas: &'a Schemas,
        factories: &'a ProviderFactories,
        hooks: &'a Hooks,
        state: State,
    ) -> Self {
        Self {
            config,
            schemas,
            hooks,
            providers: ProviderInstances::new(factories),
            state: SyncState::new(state),
            planned: Mutex::new(HashMap::new()),
            outputs: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(self)
    }

    pub fn set_planned(&self, addr: &AbsResourceInstance, value: MarkedValue) {
        lock(&self.planned).insert(addr.clone(), value);
    }

    pub fn output(&self, addr: &OutputAddr) -> Option<MarkedValue> {
        lock(&self.outputs).get(addr).cloned()
    }

    /// Schema for a resource instance, if its provider declares one
    pub fn resource_schema(
        &self,
        provider: &ProviderConfigAddr,
        addr: &AbsResourceInstance,
    ) -> Option<&'a BlockSchema> {
        self.schemas.resource(&provider.provider, &addr.resource)
    }

    /// Schema for a resource instance, or an empty one for providers that
    /// do not describe the type
    pub fn resource_schema_or_default(
        &self,
        provider: &ProviderConfigAddr,
        addr: &AbsResourceInstance,
    ) -> BlockSchema {
        self.resource_schema(provider, addr).cloned().unwrap_or_default()
    }

    fn provider_type_of(&self, addr: &AbsResourceInstance) -> Option<String> {
        if let Some(rc) = self.config.resource(addr) {
            return Some(rc.provider.provider.clone());
        }
        self.state.lock().provider_for(addr).map(|p| p.provider.clone())
    }

    fn instance_value(&self, addr: &AbsResourceInstance) -> Option<MarkedValue> {
        if let Some(planned) = lock(&self.planned).get(addr) {
            return Some(planned.clone());
        }
        let current = self.state.lock().current(addr).map(|o| o.marked_value())?;
        let schema_marks = self
            .provider_type_of(addr)
            .map(|p| self.schemas.sensitive_paths(&p, &addr.resource))
            .unwrap_or_default();
        let mut marked = current.with_marks(&schema_marks);
        marked.marks.retain_present(&marked.value);
        Some(marked)
    }

    /// Every expanded instance of a resource as one collection value
    fn collection_value(&self, addr: &AbsResourceInstance) -> Option<MarkedValue> {
        let keys: Vec<InstanceKey> = self
            .config
            .resources
            .keys()
            .filter(|a| a.same_resource(addr) && a.key != InstanceKey::NoKey)
            .map(|a| a.key.clone())
            .collect();
        if keys.is_empty() {
            return None;
        }

        let mut marks = PathSet::new();
        let mut list = Vec::new();
        let mut map = BTreeMap::new();
        for key in keys {
            let instance = addr.clone().with_key(key.clone());
            let (value, inst_marks) = self
                .instance_value(&instance)
                .unwrap_or_else(|| MarkedValue::unmarked(Value::Unknown))
                .into_parts();
            match key {
                InstanceKey::Str(k) => {
                    marks.extend_from(&inst_marks.embed(&Path::root().key(k.as_str())));
                    map.insert(k, value);
                }
                _ => {
                    marks.extend_from(&inst_marks.embed(&Path::root().index(list.len())));
                    list.push(value);
                }
            }
        }
        let value = if map.is_empty() { Value::List(list) } else { Value::Object(map) };
        Some(MarkedValue::new(value, marks))
    }

    /// Evaluate a resource's body
    pub fn eval_resource(&self, rc: &ResourceConfig) -> Result<MarkedValue, Diagnostic> {
        self.evaluator().eval_object(&rc.body).map_err(|err| {
            Diagnostic::error(DiagnosticKind::Evaluation, "Invalid reference", err.to_string())
                .with_subject(&rc.addr)
        })
    }

    /// Evaluate a provider configuration block and configure the provider
    pub fn configure_provider(
        &self,
        addr: &ProviderConfigAddr,
    ) -> Result<Arc<dyn Provider>, Diagnostic> {
        let body = match self.config.provider(addr) {
            Some(pc) => self.evaluator().eval_object(&pc.body).map_err(|err| {
                Diagnostic::error(
                    DiagnosticKind::Evaluation,
                    "Invalid provider configuration",
                    err.to_string(),
                )
                .with_subject(addr)
            })?,
            None => MarkedValue::unmarked(Value::empty_object()),
        };
        let value = match self.schemas.provider(&addr.provider) {
            Some(schema) => schema.provider.normalize(body.value),
            None => body.value,
        };
        self.providers.configure(addr, value).map_err(|detail| {
            Diagnostic::error(
                DiagnosticKind::ProviderOperation,
                "Provider configure failed",
                detail,
            )
            .with_subject(addr)
        })
    }

    /// The configured provider for a node, configuring it if no provider
    /// node did so yet
    pub fn provider(&self, addr: &ProviderConfigAddr) -> Result<Arc<dyn Provider>, Diagnostic> {
        match self.providers.get(addr) {
            Some(p) => Ok(p),
            None => self.configure_provider(addr),
        }
    }

    pub fn visit_provider(&self, addr: &ProviderConfigAddr) -> NodeResult {
        match self.configure_provider(addr) {
            Ok(_) => NodeResult::ok(),
            Err(diag) => NodeResult::failed(diag),
        }
    }

    /// Evaluate an output and keep its value for later references
    pub fn visit_output(&self, addr: &OutputAddr) -> NodeResult {
        let Some(oc) = self.config.output(addr) else {
            return NodeResult::ok();
        };
        let mut value = match self.evaluator().eval(&oc.value) {
            Ok(v) => v,
            Err(err) => {
                return NodeResult::failed(
                    Diagnostic::error(
                        DiagnosticKind::Evaluation,
                        "Invalid output value",
                        err.to_string(),
                    )
                    .with_subject(addr),
                );
            }
        };

        let mut diags = Diagnostics::new();
        if oc.sensitive {
            value = value.with_marks(&PathSet::whole());
        } else if addr.module.is_root() && !value.marks.is_empty() {
            diags.push(
                Diagnostic::error(
                    DiagnosticKind::Configuration,
                    "Output refers to sensitive values",
                    format!(
                        "To reduce the risk of accidentally exporting sensitive data, \
                         {addr} must be declared sensitive"
                    ),
                )
                .with_subject(addr),
            );
        }
        log::debug!("evaluated {addr}");
        lock(&self.outputs).insert(addr.clone(), value);
        NodeResult::from_diagnostics(diags)
    }
}

impl Scope for WalkContext<'_> {
    fn resource_value(&self, addr: &AbsResourceInstance) -> Option<MarkedValue> {
        self.instance_value(addr).or_else(|| {
            (addr.key == InstanceKey::NoKey)
                .then(|| self.collection_value(addr))
                .flatten()
        })
    }

    fn variable_value(&self, addr: &VariableAddr) -> Option<MarkedValue> {
        self.config.variable(addr).map(|var| {
            let value = MarkedValue::unmarked(var.value.clone());
            if var.sensitive {
                value.with_marks(&PathSet::whole())
            } else {
                value
            }
        })
    }

    fn output_value(&self, addr: &OutputAddr) -> Option<MarkedValue> {
        self.output(addr)
    }
}
