//! Test doubles
//!
//! [`MockProvider`] behaves like a minimal in-memory provider and records
//! every call it receives. Each operation can be replaced with a closure.

use crate::provider::{
    ApplyResourceChangeRequest, ApplyResourceChangeResponse, ConfigureRequest,
    PlanResourceChangeRequest, PlanResourceChangeResponse, Provider, ReadDataSourceRequest,
    ReadDataSourceResponse, ReadResourceRequest, ReadResourceResponse,
};
use crate::schema::{AttributeSchema, BlockSchema, ProviderSchema};
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use valuekit::{Path, Value};

type ConfigureFn = Box<dyn Fn(&ConfigureRequest) -> Result<()> + Send + Sync>;
type ReadResourceFn =
    Box<dyn Fn(&ReadResourceRequest) -> Result<ReadResourceResponse> + Send + Sync>;
type PlanFn =
    Box<dyn Fn(&PlanResourceChangeRequest) -> Result<PlanResourceChangeResponse> + Send + Sync>;
type ApplyFn =
    Box<dyn Fn(&ApplyResourceChangeRequest) -> Result<ApplyResourceChangeResponse> + Send + Sync>;
type ReadDataFn =
    Box<dyn Fn(&ReadDataSourceRequest) -> Result<ReadDataSourceResponse> + Send + Sync>;

/// One recorded provider call
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Configure(ConfigureRequest),
    ReadResource(ReadResourceRequest),
    PlanResourceChange(PlanResourceChangeRequest),
    ApplyResourceChange(ApplyResourceChangeRequest),
    ReadDataSource(ReadDataSourceRequest),
}

/// Schema used when none is given: a `test_object` resource type and a
/// `test_data` data source
pub fn default_schema() -> ProviderSchema {
    ProviderSchema::new()
        .with_provider(
            BlockSchema::new()
                .attr("region", AttributeSchema::optional())
                .attr("token", AttributeSchema::optional().sensitive()),
        )
        .with_resource(
            "test_object",
            BlockSchema::new()
                .attr("id", AttributeSchema::computed())
                .attr("value", AttributeSchema::optional())
                .attr("output", AttributeSchema::computed())
                .attr("require_new", AttributeSchema::optional())
                .attr("secret", AttributeSchema::optional().sensitive()),
        )
        .with_data_source(
            "test_data",
            BlockSchema::new()
                .attr("id", AttributeSchema::optional_computed())
                .attr("value", AttributeSchema::optional())
                .attr("output", AttributeSchema::computed()),
        )
}

/// An in-memory provider for tests
pub struct MockProvider {
    schema: ProviderSchema,
    requires_replace: Vec<Path>,
    configure_fn: RwLock<Option<ConfigureFn>>,
    read_resource_fn: RwLock<Option<ReadResourceFn>>,
    plan_fn: RwLock<Option<PlanFn>>,
    apply_fn: RwLock<Option<ApplyFn>>,
    read_data_fn: RwLock<Option<ReadDataFn>>,
    calls: Mutex<Vec<MockCall>>,
    next_id: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_schema(default_schema())
    }

    pub fn with_schema(schema: ProviderSchema) -> Self {
        Self {
            schema,
            requires_replace: vec![Path::root().key("require_new")],
            configure_fn: RwLock::new(None),
            read_resource_fn: RwLock::new(None),
            plan_fn: RwLock::new(None),
            apply_fn: RwLock::new(None),
            read_data_fn: RwLock::new(None),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Attributes whose change forces replacement in the default plan
    #[must_use]
    pub fn with_requires_replace(mut self, paths: impl IntoIterator<Item = Path>) -> Self {
        self.requires_replace = paths.into_iter().collect();
        self
    }

    pub fn set_configure(
        &self,
        f: impl Fn(&ConfigureRequest) -> Result<()> + Send + Sync + 'static,
    ) {
        *write(&self.configure_fn) = Some(Box::new(f));
    }

    pub fn set_read_resource(
        &self,
        f: impl Fn(&ReadResourceRequest) -> Result<ReadResourceResponse> + Send + Sync + 'static,
    ) {
        *write(&self.read_resource_fn) = Some(Box::new(f));
    }

    pub fn set_plan(
        &self,
        f: impl Fn(&PlanResourceChangeRequest) -> Result<PlanResourceChangeResponse>
        + Send
        + Sync
        + 'static,
    ) {
        *write(&self.plan_fn) = Some(Box::new(f));
    }

    pub fn set_apply(
        &self,
        f: impl Fn(&ApplyResourceChangeRequest) -> Result<ApplyResourceChangeResponse>
        + Send
        + Sync
        + 'static,
    ) {
        *write(&self.apply_fn) = Some(Box::new(f));
    }

    pub fn set_read_data_source(
        &self,
        f: impl Fn(&ReadDataSourceRequest) -> Result<ReadDataSourceResponse>
        + Send
        + Sync
        + 'static,
    ) {
        *write(&self.read_data_fn) = Some(Box::new(f));
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    /// Every call so far, in the order they started
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn configure_count(&self) -> usize {
        self.configure_calls().len()
    }

    pub fn configure_calls(&self) -> Vec<ConfigureRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Configure(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn read_resource_calls(&self) -> Vec<ReadResourceRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::ReadResource(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn plan_calls(&self) -> Vec<PlanResourceChangeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::PlanResourceChange(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn apply_calls(&self) -> Vec<ApplyResourceChangeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::ApplyResourceChange(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn read_data_source_calls(&self) -> Vec<ReadDataSourceRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::ReadDataSource(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn computed_attrs(&self, type_name: &str) -> Vec<String> {
        self.schema
            .resource_types
            .get(type_name)
            .or_else(|| self.schema.data_sources.get(type_name))
            .map(|block| {
                block
                    .attributes
                    .iter()
                    .filter(|(_, a)| a.computed)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn default_plan(&self, req: &PlanResourceChangeRequest) -> PlanResourceChangeResponse {
        let Some(proposed) = &req.proposed else {
            return PlanResourceChangeResponse::default();
        };
        let mut planned = proposed.clone();
        // only new objects get fresh computed values
        let computed = if req.prior.is_none() {
            self.computed_attrs(&req.type_name)
        } else {
            Vec::new()
        };
        for name in computed {
            let path = Path::root().key(name.as_str());
            if planned.get(&path).is_none_or(Value::is_null) {
                let _ = planned.set(&path, Value::Unknown);
            }
        }
        let requires_replace = match &req.prior {
            Some(prior) => self
                .requires_replace
                .iter()
                .filter(|p| prior.get(p) != planned.get(p))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        PlanResourceChangeResponse {
            planned: Some(planned),
            planned_private: Vec::new(),
            requires_replace,
        }
    }

    fn default_apply(&self, req: &ApplyResourceChangeRequest) -> ApplyResourceChangeResponse {
        let Some(planned) = &req.planned else {
            return ApplyResourceChangeResponse::default();
        };
        let mut value = planned.clone();
        let id_path = Path::root().key("id");
        if value.get(&id_path).is_some_and(Value::is_unknown) {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let _ = value.set(&id_path, Value::String(format!("{}-{n}", req.type_name)));
        }
        ApplyResourceChangeResponse {
            new_state: Some(value.null_unknowns()),
            private: req.planned_private.clone(),
        }
    }
}

impl Provider for MockProvider {
    fn schema(&self) -> ProviderSchema {
        self.schema.clone()
    }

    fn configure(&self, req: ConfigureRequest) -> Result<()> {
        self.record(MockCall::Configure(req.clone()));
        match read(&self.configure_fn).as_ref() {
            Some(f) => f(&req),
            None => Ok(()),
        }
    }

    fn read_resource(&self, req: ReadResourceRequest) -> Result<ReadResourceResponse> {
        self.record(MockCall::ReadResource(req.clone()));
        match read(&self.read_resource_fn).as_ref() {
            Some(f) => f(&req),
            None => Ok(ReadResourceResponse {
                new_state: Some(req.prior),
                private: req.private,
            }),
        }
    }

    fn plan_resource_change(
        &self,
        req: PlanResourceChangeRequest,
    ) -> Result<PlanResourceChangeResponse> {
        self.record(MockCall::PlanResourceChange(req.clone()));
        match read(&self.plan_fn).as_ref() {
            Some(f) => f(&req),
            None => Ok(self.default_plan(&req)),
        }
    }

    fn apply_resource_change(
        &self,
        req: ApplyResourceChangeRequest,
    ) -> Result<ApplyResourceChangeResponse> {
        self.record(MockCall::ApplyResourceChange(req.clone()));
        match read(&self.apply_fn).as_ref() {
            Some(f) => f(&req),
            None => Ok(self.default_apply(&req)),
        }
    }

    fn read_data_source(&self, req: ReadDataSourceRequest) -> Result<ReadDataSourceResponse> {
        self.record(MockCall::ReadDataSource(req.clone()));
        if let Some(f) = read(&self.read_data_fn).as_ref() {
            return f(&req);
        }
        let mut state = req.config.null_unknowns();
        let id_path = Path::root().key("id");
        if state.get(&id_path).is_none_or(Value::is_null) {
            let _ = state.set(&id_path, Value::String(format!("{}-data", req.type_name)));
        }
        Ok(ReadDataSourceResponse { state })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match l.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match l.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
