//! Provider Adapter
//!
//! Uniform interface to a resource provider. Providers are foreign code:
//! their failures are plain [`anyhow::Error`]s which the engine turns into
//! diagnostics attributed to the node that made the call.

use crate::addrs::ProviderConfigAddr;
use crate::schema::ProviderSchema;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use valuekit::{Path, Value};

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureRequest {
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResourceRequest {
    pub type_name: String,
    pub prior: Value,
    pub private: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResourceResponse {
    /// `None` if the object no longer exists
    pub new_state: Option<Value>,
    pub private: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanResourceChangeRequest {
    pub type_name: String,
    /// `None` when creating
    pub prior: Option<Value>,
    /// `None` when destroying
    pub proposed: Option<Value>,
    /// Configuration as written, before prior values were merged in
    pub config: Option<Value>,
    pub prior_private: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanResourceChangeResponse {
    /// `None` when destroying
    pub planned: Option<Value>,
    pub planned_private: Vec<u8>,
    /// Attributes whose change forces replacement
    pub requires_replace: Vec<Path>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyResourceChangeRequest {
    pub type_name: String,
    pub prior: Option<Value>,
    /// `None` when destroying
    pub planned: Option<Value>,
    pub config: Option<Value>,
    /// Exactly the bytes returned at plan time
    pub planned_private: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyResourceChangeResponse {
    /// `None` once destroyed
    pub new_state: Option<Value>,
    pub private: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadDataSourceRequest {
    pub type_name: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadDataSourceResponse {
    pub state: Value,
}

// ============================================================================
// Provider trait
// ============================================================================

/// A resource provider
pub trait Provider: Send + Sync {
    /// Static description of what the provider offers
    fn schema(&self) -> ProviderSchema;

    /// Called once per provider configuration per operation
    fn configure(&self, req: ConfigureRequest) -> Result<()>;

    /// Refresh an object. The default reports it unchanged.
    fn read_resource(&self, req: ReadResourceRequest) -> Result<ReadResourceResponse> {
        Ok(ReadResourceResponse {
            new_state: Some(req.prior),
            private: req.private,
        })
    }

    fn plan_resource_change(&self, req: PlanResourceChangeRequest)
    -> Result<PlanResourceChangeResponse>;

    fn apply_resource_change(
        &self,
        req: ApplyResourceChangeRequest,
    ) -> Result<ApplyResourceChangeResponse>;

    fn read_data_source(&self, req: ReadDataSourceRequest) -> Result<ReadDataSourceResponse>;
}

/// Creates provider instances
pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Provider factories by provider type name
#[derive(Clone, Default)]
pub struct ProviderFactories {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a provider type
    pub fn register(
        mut self,
        provider_type: impl Into<String>,
        factory: impl Fn() -> Result<Arc<dyn Provider>> + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(provider_type.into(), Arc::new(factory));
        self
    }

    /// Register a factory that always hands out the same instance
    pub fn register_fixed(
        self,
        provider_type: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        self.register(provider_type, move || Ok(Arc::clone(&provider)))
    }

    pub fn get(&self, provider_type: &str) -> Option<&ProviderFactory> {
        self.factories.get(provider_type)
    }

    pub fn contains(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

// ============================================================================
// Per-operation instances
// ============================================================================

type InstanceCell = Arc<OnceLock<std::result::Result<Arc<dyn Provider>, String>>>;

/// Configured provider instances for one plan or apply.
///
/// Each provider configuration is initialized at most once. Concurrent
/// requesters for the same address block until the first initializer
/// finishes and then share its result.
pub(crate) struct ProviderInstances<'a> {
    factories: &'a ProviderFactories,
    cells: Mutex<HashMap<ProviderConfigAddr, InstanceCell>>,
}

impl<'a> ProviderInstances<'a> {
    pub(crate) fn new(factories: &'a ProviderFactories) -> Self {
        Self {
            factories,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, addr: &ProviderConfigAddr) -> InstanceCell {
        let mut cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(cells.entry(addr.clone()).or_default())
    }

    /// Create and configure the provider for `addr`, or return the instance
    /// an earlier caller produced
    pub(crate) fn configure(
        &self,
        addr: &ProviderConfigAddr,
        config: Value,
    ) -> std::result::Result<Arc<dyn Provider>, String> {
        let cell = self.cell(addr);
        cell.get_or_init(|| {
            log::debug!("configuring {addr}");
            let factory = self
                .factories
                .get(&addr.provider)
                .ok_or_else(|| format!("no factory registered for provider {:?}", addr.provider))?;
            let provider = factory().map_err(|e| format!("{e:#}"))?;
            provider
                .configure(ConfigureRequest { config })
                .map_err(|e| format!("{e:#}"))?;
            Ok(provider)
        })
        .clone()
    }

    /// A provider configured earlier in this operation
    pub(crate) fn get(&self, addr: &ProviderConfigAddr) -> Option<Arc<dyn Provider>> {
        self.cell(addr).get().and_then(|r| r.as_ref().ok()).cloned()
    }
}
