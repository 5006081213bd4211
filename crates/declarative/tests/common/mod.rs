//! Shared fixtures for the scenario tests

#![allow(dead_code)]

use declarative::testing::MockProvider;
use declarative::{
    AbsResourceInstance, Action, ConfigResource, Context, ContextOpts, DeposedKey, Expr, Hook,
    HookAction, ModuleInstance, ProviderConfigAddr, ProviderFactories, ResourceInstanceObject,
    State,
};
use std::sync::{Arc, Mutex};
use valuekit::Value;

pub fn addr(s: &str) -> AbsResourceInstance {
    s.parse().unwrap()
}

pub fn resource(s: &str) -> ConfigResource {
    s.parse().unwrap()
}

pub fn reference(s: &str) -> Expr {
    Expr::reference(s, &ModuleInstance::root()).unwrap()
}

pub fn test_provider() -> ProviderConfigAddr {
    ProviderConfigAddr::root("test")
}

/// A `test_object` value with every schema attribute present
pub fn object(id: &str, value: Option<&str>) -> Value {
    Value::object([
        ("id", Value::from(id)),
        ("value", value.map_or(Value::Null, Value::from)),
        ("output", Value::Null),
        ("require_new", Value::Null),
        ("secret", Value::Null),
    ])
}

/// Record a current object under the `test` provider
pub fn put(state: &mut State, s: &str, object: ResourceInstanceObject) {
    state.set_current(&addr(s), object, &test_provider());
}

pub fn context(mock: &Arc<MockProvider>) -> Context {
    context_with(mock, Vec::new())
}

pub fn context_with(mock: &Arc<MockProvider>, hooks: Vec<Arc<dyn Hook>>) -> Context {
    let mut opts =
        ContextOpts::with_providers(ProviderFactories::new().register_fixed("test", mock.clone()));
    for hook in hooks {
        opts = opts.hook(hook);
    }
    Context::new(opts).unwrap()
}

/// One `pre_apply` notification
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyEvent {
    pub addr: String,
    pub deposed: Option<DeposedKey>,
    pub action: Action,
}

/// Records the order in which instances are applied
#[derive(Default)]
pub struct ApplyRecorder {
    events: Mutex<Vec<ApplyEvent>>,
    /// Halt the walk after the first `pre_apply`
    pub halt: bool,
}

impl ApplyRecorder {
    pub fn halting() -> Self {
        Self {
            halt: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<ApplyEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Position of the first event for `addr` and `deposed`
    pub fn position(&self, addr: &str, deposed: bool) -> usize {
        self.events()
            .iter()
            .position(|e| e.addr == addr && e.deposed.is_some() == deposed)
            .unwrap_or_else(|| panic!("{addr} was never applied"))
    }
}

impl Hook for ApplyRecorder {
    fn pre_apply(
        &self,
        addr: &AbsResourceInstance,
        deposed: Option<&DeposedKey>,
        action: Action,
    ) -> HookAction {
        self.events.lock().unwrap().push(ApplyEvent {
            addr: addr.to_string(),
            deposed: deposed.cloned(),
            action,
        });
        if self.halt {
            HookAction::Halt
        } else {
            HookAction::Continue
        }
    }
}
