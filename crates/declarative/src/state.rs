//! State snapshots
//!
//! A snapshot maps module instance → resource → instance key to one
//! optional current object plus any number of deposed objects, and keeps the
//! root module's output values.

use crate::addrs::{
    AbsResourceInstance, ConfigResource, DeposedKey, InstanceKey, ModuleInstance, OutputAddr,
    ProviderConfigAddr, Resource, ResourceMode,
};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use valuekit::{MarkedValue, PathSet, Value};

// ============================================================================
// Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    #[default]
    Ready,
    /// Must be replaced on the next plan
    Tainted,
    /// Planned during this operation; may still contain unknowns
    Planned,
}

/// The recorded value of one resource instance object
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceInstanceObject {
    #[serde(default)]
    pub status: ObjectStatus,
    pub value: Value,
    #[serde(default, skip_serializing_if = "PathSet::is_empty")]
    pub sensitive_paths: PathSet,
    /// Resources this object's value was derived from
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<ConfigResource>,
    /// Opaque provider data
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub private: Vec<u8>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub create_before_destroy: bool,
}

impl ResourceInstanceObject {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    pub fn tainted(mut self) -> Self {
        self.status = ObjectStatus::Tainted;
        self
    }

    pub fn with_status(mut self, status: ObjectStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_sensitive_paths(mut self, paths: PathSet) -> Self {
        self.sensitive_paths = paths;
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = ConfigResource>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    pub fn with_private(mut self, private: Vec<u8>) -> Self {
        self.private = private;
        self
    }

    pub fn is_tainted(&self) -> bool {
        self.status == ObjectStatus::Tainted
    }

    /// The value with its sensitivity marks
    pub fn marked_value(&self) -> MarkedValue {
        MarkedValue::new(self.value.clone(), self.sensitive_paths.clone())
    }

    /// Keep only marks whose paths exist in the value
    pub fn normalize_marks(&mut self) {
        self.sensitive_paths.retain_present(&self.value);
    }
}

/// Private provider bytes as a hex string
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Write;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            let _ = write!(out, "{b:02x}");
        }
        serializer.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex string"));
        }
        (0..raw.len())
            .step_by(2)
            .map(|i| {
                raw.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| serde::de::Error::custom("invalid hex byte"))
            })
            .collect()
    }
}

// ============================================================================
// Snapshot tree
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceInstanceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ResourceInstanceObject>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deposed: BTreeMap<DeposedKey, ResourceInstanceObject>,
}

impl ResourceInstanceState {
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.deposed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub provider: ProviderConfigAddr,
    #[serde(default)]
    pub instances: BTreeMap<InstanceKey, ResourceInstanceState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: Value,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleState {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<Resource, ResourceState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputValue>,
}

impl ModuleState {
    fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.outputs.is_empty()
    }
}

/// An entry yielded when walking every instance in a snapshot
pub struct InstanceEntry<'a> {
    pub addr: AbsResourceInstance,
    pub provider: &'a ProviderConfigAddr,
    pub state: &'a ResourceInstanceState,
}

/// A complete state snapshot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub modules: BTreeMap<ModuleInstance, ModuleState>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no resources or outputs are recorded
    pub fn is_empty(&self) -> bool {
        self.modules.values().all(ModuleState::is_empty)
    }

    pub fn module(&self, module: &ModuleInstance) -> Option<&ModuleState> {
        self.modules.get(module)
    }

    pub fn resource_instance(&self, addr: &AbsResourceInstance) -> Option<&ResourceInstanceState> {
        self.modules
            .get(&addr.module)?
            .resources
            .get(&addr.resource)?
            .instances
            .get(&addr.key)
    }

    fn resource_instance_mut(
        &mut self,
        addr: &AbsResourceInstance,
    ) -> Option<&mut ResourceInstanceState> {
        self.modules
            .get_mut(&addr.module)?
            .resources
            .get_mut(&addr.resource)?
            .instances
            .get_mut(&addr.key)
    }

    fn ensure_instance(
        &mut self,
        addr: &AbsResourceInstance,
        provider: &ProviderConfigAddr,
    ) -> &mut ResourceInstanceState {
        let resource = self
            .modules
            .entry(addr.module.clone())
            .or_default()
            .resources
            .entry(addr.resource.clone())
            .or_insert_with(|| ResourceState {
                provider: provider.clone(),
                instances: BTreeMap::new(),
            });
        resource.provider = provider.clone();
        resource.instances.entry(addr.key.clone()).or_default()
    }

    pub fn current(&self, addr: &AbsResourceInstance) -> Option<&ResourceInstanceObject> {
        self.resource_instance(addr)?.current.as_ref()
    }

    pub fn current_mut(
        &mut self,
        addr: &AbsResourceInstance,
    ) -> Option<&mut ResourceInstanceObject> {
        self.resource_instance_mut(addr)?.current.as_mut()
    }

    pub fn deposed(
        &self,
        addr: &AbsResourceInstance,
        key: &DeposedKey,
    ) -> Option<&ResourceInstanceObject> {
        self.resource_instance(addr)?.deposed.get(key)
    }

    /// Provider configuration recorded for the instance's resource
    pub fn provider_for(&self, addr: &AbsResourceInstance) -> Option<&ProviderConfigAddr> {
        self.modules
            .get(&addr.module)?
            .resources
            .get(&addr.resource)
            .map(|r| &r.provider)
    }

    pub fn set_current(
        &mut self,
        addr: &AbsResourceInstance,
        object: ResourceInstanceObject,
        provider: &ProviderConfigAddr,
    ) {
        self.ensure_instance(addr, provider).current = Some(object);
    }

    pub fn remove_current(&mut self, addr: &AbsResourceInstance) -> Option<ResourceInstanceObject> {
        let removed = self.resource_instance_mut(addr)?.current.take();
        self.prune_instance(addr);
        removed
    }

    pub fn set_deposed(
        &mut self,
        addr: &AbsResourceInstance,
        key: DeposedKey,
        object: ResourceInstanceObject,
        provider: &ProviderConfigAddr,
    ) {
        self.ensure_instance(addr, provider).deposed.insert(key, object);
    }

    pub fn remove_deposed(
        &mut self,
        addr: &AbsResourceInstance,
        key: &DeposedKey,
    ) -> Option<ResourceInstanceObject> {
        let removed = self.resource_instance_mut(addr)?.deposed.remove(key);
        self.prune_instance(addr);
        removed
    }

    /// Move the current object aside under `key`. Returns false if there
    /// was no current object.
    pub fn depose_current(&mut self, addr: &AbsResourceInstance, key: DeposedKey) -> bool {
        let Some(instance) = self.resource_instance_mut(addr) else {
            return false;
        };
        match instance.current.take() {
            Some(object) => {
                instance.deposed.insert(key, object);
                true
            }
            None => false,
        }
    }

    /// Every resource instance, in address order
    pub fn instances(&self) -> impl Iterator<Item = InstanceEntry<'_>> {
        self.modules.iter().flat_map(|(module, ms)| {
            ms.resources.iter().flat_map(move |(resource, rs)| {
                rs.instances.iter().map(move |(key, state)| InstanceEntry {
                    addr: AbsResourceInstance::new(module.clone(), resource.clone(), key.clone()),
                    provider: &rs.provider,
                    state,
                })
            })
        })
    }

    pub fn has_managed_resources(&self) -> bool {
        self.instances()
            .any(|e| e.addr.resource.mode == ResourceMode::Managed)
    }

    /// Drop every data resource
    pub fn remove_data_resources(&mut self) {
        for ms in self.modules.values_mut() {
            ms.resources.retain(|r, _| r.mode != ResourceMode::Data);
        }
        self.modules.retain(|m, ms| m.is_root() || !ms.is_empty());
    }

    pub fn output(&self, addr: &OutputAddr) -> Option<&OutputValue> {
        self.modules.get(&addr.module)?.outputs.get(&addr.name)
    }

    pub fn set_output(&mut self, addr: &OutputAddr, value: OutputValue) {
        self.modules
            .entry(addr.module.clone())
            .or_default()
            .outputs
            .insert(addr.name.clone(), value);
    }

    pub fn remove_output(&mut self, addr: &OutputAddr) -> Option<OutputValue> {
        self.modules.get_mut(&addr.module)?.outputs.remove(&addr.name)
    }

    /// Root module outputs
    pub fn root_outputs(&self) -> impl Iterator<Item = (&String, &OutputValue)> {
        self.modules
            .get(&ModuleInstance::root())
            .into_iter()
            .flat_map(|ms| ms.outputs.iter())
    }

    fn prune_instance(&mut self, addr: &AbsResourceInstance) {
        let Some(ms) = self.modules.get_mut(&addr.module) else {
            return;
        };
        if let Some(rs) = ms.resources.get_mut(&addr.resource) {
            if rs.instances.get(&addr.key).is_some_and(ResourceInstanceState::is_empty) {
                rs.instances.remove(&addr.key);
            }
            if rs.instances.is_empty() {
                ms.resources.remove(&addr.resource);
            }
        }
        if !addr.module.is_root() && ms.is_empty() {
            self.modules.remove(&addr.module);
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }
}

// ============================================================================
// Synchronized access
// ============================================================================

/// A state snapshot shared between walk workers.
///
/// Every mutation happens under one mutex, one result at a time. A worker
/// that panicked while holding the lock does not make the state
/// unreachable: poisoned locks are recovered.
#[derive(Debug, Default)]
pub struct SyncState {
    inner: Mutex<State>,
}

impl SyncState {
    pub fn new(state: State) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.lock())
    }

    /// A deep copy of the current snapshot
    pub fn snapshot(&self) -> State {
        self.lock().clone()
    }

    pub fn into_inner(self) -> State {
        match self.inner.into_inner() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(s: &str) -> AbsResourceInstance {
        s.parse().unwrap()
    }

    fn provider() -> ProviderConfigAddr {
        ProviderConfigAddr::root("test")
    }

    #[test]
    fn test_set_and_remove_current_prunes_tree() {
        let mut state = State::new();
        let a = addr("module.m.test_object.a[0]");
        state.set_current(&a, ResourceInstanceObject::new(Value::from("x")), &provider());
        assert_eq!(state.current(&a).unwrap().value, Value::from("x"));
        assert_eq!(state.provider_for(&a), Some(&provider()));

        assert!(state.remove_current(&a).is_some());
        assert!(state.resource_instance(&a).is_none());
        assert!(state.module(&a.module).is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn test_depose_current() {
        let mut state = State::new();
        let a = addr("test_object.a");
        state.set_current(&a, ResourceInstanceObject::new(Value::from("old")), &provider());

        let key = DeposedKey::generate();
        assert!(state.depose_current(&a, key.clone()));
        assert!(state.current(&a).is_none());
        assert_eq!(state.deposed(&a, &key).unwrap().value, Value::from("old"));
        assert!(!state.depose_current(&a, DeposedKey::generate()));

        state.set_current(&a, ResourceInstanceObject::new(Value::from("new")), &provider());
        assert!(state.remove_deposed(&a, &key).is_some());
        assert!(state.current(&a).is_some());
    }

    #[test]
    fn test_instances_iteration() {
        let mut state = State::new();
        for s in ["test_object.b", "test_object.a", "data.test_data.d"] {
            state.set_current(&addr(s), ResourceInstanceObject::new(Value::Null), &provider());
        }
        let addrs: Vec<String> = state.instances().map(|e| e.addr.to_string()).collect();
        assert_eq!(addrs, vec!["test_object.a", "test_object.b", "data.test_data.d"]);

        state.remove_data_resources();
        assert_eq!(state.instances().count(), 2);
        assert!(state.has_managed_resources());
    }

    #[test]
    fn test_outputs() {
        let mut state = State::new();
        let out = OutputAddr::root("id");
        state.set_output(
            &out,
            OutputValue {
                value: Value::from("x"),
                sensitive: true,
            },
        );
        assert_eq!(state.root_outputs().count(), 1);
        assert!(state.output(&out).unwrap().sensitive);
        assert!(state.remove_output(&out).is_some());
        assert!(state.is_empty());
    }

    #[test]
    fn test_json_roundtrip_keeps_private_and_deps() {
        let mut state = State::new();
        let a = addr(r#"test_object.a["k"]"#);
        let object = ResourceInstanceObject::new(Value::object([("id", Value::from("1"))]))
            .with_private(b"planned".to_vec())
            .with_dependencies(["test_object.b".parse().unwrap()])
            .with_sensitive_paths(PathSet::whole())
            .tainted();
        state.set_current(&a, object, &provider());
        let object = ResourceInstanceObject::default();
        state.set_deposed(&a, DeposedKey::generate(), object, &provider());

        let json = state.to_json_pretty().unwrap();
        assert!(json.contains("706c616e6e6564"));
        let back = State::from_json_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_sync_state_recovers_from_poison() {
        let shared = Arc::new(SyncState::new(State::new()));
        let poisoner = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("intentional poison");
        })
        .join();

        shared.with(|s| s.set_output(&OutputAddr::root("x"), OutputValue {
            value: Value::Bool(true),
            sensitive: false,
        }));
        let state = Arc::try_unwrap(shared).unwrap().into_inner();
        assert_eq!(state.root_outputs().count(), 1);
    }
}
