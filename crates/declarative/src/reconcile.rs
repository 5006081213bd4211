//! State Reconciler
//!
//! Node results are expressed as [`StateEffect`]s and merged into the shared
//! snapshot one node at a time, so concurrent nodes never interleave their
//! writes.

use crate::addrs::{AbsResourceInstance, ConfigResource, DeposedKey, OutputAddr, ProviderConfigAddr};
use crate::config::Config;
use crate::state::{ObjectStatus, OutputValue, ResourceInstanceObject, State, SyncState};
use std::collections::BTreeSet;
use valuekit::{MarkedValue, Value};

/// One change to a state snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum StateEffect {
    SetCurrent {
        addr: AbsResourceInstance,
        provider: ProviderConfigAddr,
        object: ResourceInstanceObject,
    },
    RemoveCurrent {
        addr: AbsResourceInstance,
    },
    /// Move the current object aside under `key`
    DeposeCurrent {
        addr: AbsResourceInstance,
        key: DeposedKey,
    },
    RemoveDeposed {
        addr: AbsResourceInstance,
        key: DeposedKey,
    },
    SetOutput {
        addr: OutputAddr,
        value: OutputValue,
    },
    RemoveOutput {
        addr: OutputAddr,
    },
}

impl StateEffect {
    fn apply(self, state: &mut State) {
        match self {
            Self::SetCurrent {
                addr,
                provider,
                mut object,
            } => {
                object.normalize_marks();
                log::debug!("state: set {addr}");
                state.set_current(&addr, object, &provider);
            }
            Self::RemoveCurrent { addr } => {
                log::debug!("state: remove {addr}");
                state.remove_current(&addr);
            }
            Self::DeposeCurrent { addr, key } => {
                if state.depose_current(&addr, key.clone()) {
                    log::debug!("state: deposed {addr} as {key}");
                }
            }
            Self::RemoveDeposed { addr, key } => {
                log::debug!("state: remove {addr} deposed {key}");
                state.remove_deposed(&addr, &key);
            }
            Self::SetOutput { addr, value } => state.set_output(&addr, value),
            Self::RemoveOutput { addr } => {
                state.remove_output(&addr);
            }
        }
    }
}

fn apply_all(state: &mut State, effects: impl IntoIterator<Item = StateEffect>) {
    for effect in effects {
        effect.apply(state);
    }
}

/// Apply `effects` to `prior`, in order.
///
/// This is the offline form of [`commit`]: the same effects produce the same
/// snapshot whether they are merged here in one go or committed node by
/// node during a walk.
pub fn merge(mut prior: State, effects: impl IntoIterator<Item = StateEffect>) -> State {
    apply_all(&mut prior, effects);
    prior
}

/// Apply one node's effects to the shared snapshot under a single lock
pub fn commit(state: &SyncState, effects: impl IntoIterator<Item = StateEffect>) {
    state.with(|s| apply_all(s, effects));
}

/// The object to record for a realized value
pub fn realized_object(
    value: MarkedValue,
    dependencies: BTreeSet<ConfigResource>,
    private: Vec<u8>,
    create_before_destroy: bool,
) -> ResourceInstanceObject {
    let (value, marks) = value.into_parts();
    let mut object = ResourceInstanceObject {
        status: ObjectStatus::Ready,
        value,
        sensitive_paths: marks,
        dependencies,
        private,
        create_before_destroy,
    };
    object.normalize_marks();
    object
}

/// A result that still has unknowns is recorded tainted with them nulled
pub fn tainted_object(object: ResourceInstanceObject) -> ResourceInstanceObject {
    let mut object = ResourceInstanceObject {
        value: object.value.null_unknowns(),
        ..object
    }
    .tainted();
    object.normalize_marks();
    object
}

/// Recompute the recorded dependencies of an unchanged instance from its
/// configuration. Orphans keep what they had.
pub fn refresh_dependencies(state: &mut State, config: &Config, addr: &AbsResourceInstance) {
    if config.resource(addr).is_none() {
        return;
    }
    let deps = config.dependencies_of(addr);
    if let Some(object) = state.current_mut(addr) {
        if object.dependencies != deps {
            log::debug!("dependencies of {addr} recomputed");
        }
        object.dependencies = deps;
    }
}

/// Record a root output value. Null outputs are removed.
pub fn output_effect(addr: &OutputAddr, value: &MarkedValue, sensitive: bool) -> StateEffect {
    if value.value.is_null() {
        return StateEffect::RemoveOutput { addr: addr.clone() };
    }
    StateEffect::SetOutput {
        addr: addr.clone(),
        value: OutputValue {
            value: value.value.clone(),
            sensitive: sensitive || !value.marks.is_empty(),
        },
    }
}

/// Drop every root output and every data resource, as a destroy leaves
/// nothing behind
pub fn finish_destroy(state: &mut State) {
    let outputs: Vec<OutputAddr> = state
        .root_outputs()
        .map(|(name, _)| OutputAddr::root(name.clone()))
        .collect();
    for addr in outputs {
        state.remove_output(&addr);
    }
    state.remove_data_resources();
}

/// True if `value` can be committed as-is
pub fn is_complete(value: &Value) -> bool {
    value.is_wholly_known()
}
