//! Observer hooks and cancellation

use crate::addrs::{AbsResourceInstance, DeposedKey};
use crate::graph::NodeKind;
use crate::types::{Action, ResourceInstanceChange};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use valuekit::Value;

/// What the walk should do after a hook returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAction {
    #[default]
    Continue,
    /// Stop scheduling new nodes, like an external stop
    Halt,
}

/// Receives notifications at node state transitions.
///
/// Hooks are called synchronously from walk workers, possibly from several
/// threads at once. Every method defaults to doing nothing.
pub trait Hook: Send + Sync {
    fn pre_refresh(
        &self,
        _addr: &AbsResourceInstance,
        _deposed: Option<&DeposedKey>,
    ) -> HookAction {
        HookAction::Continue
    }

    /// `new_value` is `None` if the object no longer exists
    fn post_refresh(
        &self,
        _addr: &AbsResourceInstance,
        _deposed: Option<&DeposedKey>,
        _new_value: Option<&Value>,
    ) -> HookAction {
        HookAction::Continue
    }

    fn pre_diff(&self, _addr: &AbsResourceInstance, _deposed: Option<&DeposedKey>) -> HookAction {
        HookAction::Continue
    }

    fn post_diff(&self, _change: &ResourceInstanceChange) -> HookAction {
        HookAction::Continue
    }

    fn pre_apply(
        &self,
        _addr: &AbsResourceInstance,
        _deposed: Option<&DeposedKey>,
        _action: Action,
    ) -> HookAction {
        HookAction::Continue
    }

    /// `error` is set if the provider call failed
    fn post_apply(
        &self,
        _addr: &AbsResourceInstance,
        _deposed: Option<&DeposedKey>,
        _error: Option<&str>,
    ) -> HookAction {
        HookAction::Continue
    }

    fn node_skipped(&self, _node: &NodeKind, _reason: &str) {}
}

/// A hook that does nothing
pub struct NoHook;

impl Hook for NoHook {}

/// Clonable cancellation flag
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Every registered hook, plus the stop flag a `Halt` sets
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Arc<dyn Hook>>,
    stop: StopHandle,
}

impl Hooks {
    pub fn new(hooks: Vec<Arc<dyn Hook>>, stop: StopHandle) -> Self {
        Self { hooks, stop }
    }

    fn each(&self, f: impl Fn(&dyn Hook) -> HookAction) {
        let mut halt = false;
        for hook in &self.hooks {
            halt |= f(hook.as_ref()) == HookAction::Halt;
        }
        if halt {
            log::info!("hook requested halt");
            self.stop.stop();
        }
    }

    pub fn pre_refresh(&self, addr: &AbsResourceInstance, deposed: Option<&DeposedKey>) {
        self.each(|h| h.pre_refresh(addr, deposed));
    }

    pub fn post_refresh(
        &self,
        addr: &AbsResourceInstance,
        deposed: Option<&DeposedKey>,
        new_value: Option<&Value>,
    ) {
        self.each(|h| h.post_refresh(addr, deposed, new_value));
    }

    pub fn pre_diff(&self, addr: &AbsResourceInstance, deposed: Option<&DeposedKey>) {
        self.each(|h| h.pre_diff(addr, deposed));
    }

    pub fn post_diff(&self, change: &ResourceInstanceChange) {
        self.each(|h| h.post_diff(change));
    }

    pub fn pre_apply(
        &self,
        addr: &AbsResourceInstance,
        deposed: Option<&DeposedKey>,
        action: Action,
    ) {
        self.each(|h| h.pre_apply(addr, deposed, action));
    }

    pub fn post_apply(
        &self,
        addr: &AbsResourceInstance,
        deposed: Option<&DeposedKey>,
        error: Option<&str>,
    ) {
        self.each(|h| h.post_apply(addr, deposed, error));
    }

    pub fn node_skipped(&self, node: &NodeKind, reason: &str) {
        for hook in &self.hooks {
            hook.node_skipped(node, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        halt: bool,
    }

    impl Hook for Recorder {
        fn pre_apply(
            &self,
            addr: &AbsResourceInstance,
            deposed: Option<&DeposedKey>,
            action: Action,
        ) -> HookAction {
            let key = deposed.map(ToString::to_string).unwrap_or_default();
            self.seen.lock().unwrap().push(format!("{addr} {key} {action}"));
            if self.halt { HookAction::Halt } else { HookAction::Continue }
        }
    }

    #[test]
    fn test_fan_out_and_halt() {
        let quiet = Arc::new(Recorder::default());
        let halting = Arc::new(Recorder {
            halt: true,
            ..Recorder::default()
        });
        let stop = StopHandle::new();
        let hooks = Hooks::new(
            vec![quiet.clone(), halting.clone(), Arc::new(NoHook)],
            stop.clone(),
        );

        let addr = AbsResourceInstance::managed("test_object", "a");
        let key: DeposedKey = "0000abcd".parse().unwrap();
        hooks.pre_apply(&addr, Some(&key), Action::Delete);

        assert_eq!(quiet.seen.lock().unwrap().as_slice(), ["test_object.a 0000abcd delete"]);
        assert_eq!(halting.seen.lock().unwrap().len(), 1);
        assert!(stop.is_stopped());
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let a = StopHandle::new();
        let b = a.clone();
        assert!(!b.is_stopped());
        a.stop();
        assert!(b.is_stopped());
    }
}
