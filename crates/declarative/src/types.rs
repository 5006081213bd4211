//! Core types for plans and their application

use crate::addrs::{
    AbsResourceInstance, DeposedKey, ModuleInstance, OutputAddr, ProviderConfigAddr, Resource,
};
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::state::State;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use valuekit::{Path, PathSet, Value};

/// Order of the two halves of a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOrder {
    /// `create_before_destroy`: the successor exists before the original goes
    CreateThenDelete,
    DeleteThenCreate,
}

/// What a change does to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    Create,
    /// Data source read deferred to apply
    Read,
    Update,
    Delete,
    Replace(ReplaceOrder),
}

impl Action {
    /// True if applying the change calls the provider
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    pub const fn is_replace(self) -> bool {
        matches!(self, Self::Replace(_))
    }

    /// True if the original object goes away
    pub const fn destroys(self) -> bool {
        matches!(self, Self::Delete | Self::Replace(_))
    }

    /// Short symbol used when rendering plans
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Read => "<=",
            Self::Update => "~",
            Self::Delete => "-",
            Self::Replace(ReplaceOrder::CreateThenDelete) => "+/-",
            Self::Replace(ReplaceOrder::DeleteThenCreate) => "-/+",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace(ReplaceOrder::CreateThenDelete) => "replace (create before destroy)",
            Self::Replace(ReplaceOrder::DeleteThenCreate) => "replace",
        };
        f.write_str(s)
    }
}

/// Why an action was chosen, when it is not obvious from the values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// Prior object is tainted
    Tainted,
    /// Provider declared an attribute change requires replacement
    RequiresReplace,
    /// No configuration for the instance any more
    NoConfiguration,
    /// Plan is in destroy mode
    DestroyMode,
    /// Deposed object left over from an earlier replacement
    Deposed,
    /// Only sensitivity marks changed
    SensitivityChanged,
}

/// The planned change for one resource instance object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceChange {
    pub addr: AbsResourceInstance,
    /// Set when the change applies to a deposed object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<DeposedKey>,
    pub provider: ProviderConfigAddr,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ChangeReason>,
    pub before: Option<Value>,
    /// May contain unknowns
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "PathSet::is_empty")]
    pub before_sensitive: PathSet,
    #[serde(default, skip_serializing_if = "PathSet::is_empty")]
    pub after_sensitive: PathSet,
    /// Provider data from plan, passed back verbatim at apply
    #[serde(default, with = "crate::state::hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub private: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_replace: Vec<Path>,
}

impl ResourceInstanceChange {
    /// Display address, including the deposed key
    pub fn display_addr(&self) -> String {
        match &self.deposed {
            Some(key) => format!("{} (deposed object {key})", self.addr),
            None => self.addr.to_string(),
        }
    }
}

/// Planned change of an output value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChange {
    pub addr: OutputAddr,
    pub action: Action,
    pub before: Option<Value>,
    pub after: Option<Value>,
    #[serde(default)]
    pub sensitive: bool,
}

/// Every planned change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changes {
    pub resources: Vec<ResourceInstanceChange>,
    #[serde(default)]
    pub outputs: Vec<OutputChange>,
}

impl Changes {
    /// Change for the current object (`deposed == None`) or a deposed one
    pub fn resource(
        &self,
        addr: &AbsResourceInstance,
        deposed: Option<&DeposedKey>,
    ) -> Option<&ResourceInstanceChange> {
        self.resources
            .iter()
            .find(|c| &c.addr == addr && c.deposed.as_ref() == deposed)
    }

    /// True if nothing would change
    pub fn is_empty(&self) -> bool {
        self.resources.iter().all(|c| !c.action.is_change())
            && self.outputs.iter().all(|c| !c.action.is_change())
    }

    /// Resource changes that call a provider
    pub fn actionable(&self) -> impl Iterator<Item = &ResourceInstanceChange> {
        self.resources.iter().filter(|c| c.action.is_change())
    }

    pub(crate) fn sort(&mut self) {
        self.resources
            .sort_by(|a, b| (&a.addr, &a.deposed).cmp(&(&b.addr, &b.deposed)));
        self.outputs.sort_by(|a, b| a.addr.cmp(&b.addr));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    #[default]
    Normal,
    /// Destroy everything in state
    Destroy,
    /// Only refresh state, change nothing
    RefreshOnly,
}

/// Restricts an operation to part of the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Everything inside a module instance
    Module(ModuleInstance),
    /// Every instance of a resource
    Resource(ModuleInstance, Resource),
    Instance(AbsResourceInstance),
}

impl Target {
    pub fn matches(&self, addr: &AbsResourceInstance) -> bool {
        match self {
            Self::Module(m) => addr.module.steps().starts_with(m.steps()),
            Self::Resource(m, r) => &addr.module == m && &addr.resource == r,
            Self::Instance(i) => i == addr,
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(module) = s.parse::<ModuleInstance>() {
            if !module.is_root() {
                return Ok(Self::Module(module));
            }
        }
        let instance: AbsResourceInstance = s.parse()?;
        let keyed = s.trim_end().ends_with(']');
        if keyed {
            Ok(Self::Instance(instance))
        } else {
            Ok(Self::Resource(instance.module, instance.resource))
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(m) => write!(f, "{m}"),
            Self::Resource(m, r) if m.is_root() => write!(f, "{r}"),
            Self::Resource(m, r) => write!(f, "{m}.{r}"),
            Self::Instance(i) => write!(f, "{i}"),
        }
    }
}

/// Options for [`Context::plan`](crate::Context::plan)
#[derive(Debug, Clone, Default)]
pub struct PlanOpts {
    pub mode: PlanMode,
    /// Use prior state as-is instead of asking providers
    pub skip_refresh: bool,
    pub targets: Vec<Target>,
}

impl PlanOpts {
    pub fn destroy() -> Self {
        Self {
            mode: PlanMode::Destroy,
            ..Self::default()
        }
    }
}

/// Result of planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub mode: PlanMode,
    pub changes: Changes,
    /// State after refresh; the base the changes apply to
    pub prior_state: State,
    /// State as given to plan, before refresh
    pub prev_run_state: State,
    #[serde(default)]
    pub targeted: bool,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

impl Plan {
    /// False if planning reported errors
    pub fn is_applyable(&self) -> bool {
        !self.diagnostics.has_errors()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }
}

/// Counts of what an apply did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub read: usize,
    pub no_change: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ApplySummary {
    /// Count a successfully applied change
    pub fn add_action(&mut self, action: Action) {
        match action {
            Action::NoOp => self.no_change += 1,
            Action::Create => self.created += 1,
            Action::Read => self.read += 1,
            Action::Update => self.updated += 1,
            Action::Delete => self.deleted += 1,
            Action::Replace(_) => self.replaced += 1,
        }
    }

    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Check if the apply was fully successful
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    pub fn merge(&mut self, other: &Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.replaced += other.replaced;
        self.deleted += other.deleted;
        self.read += other.read;
        self.no_change += other.no_change;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Result of [`Context::apply`](crate::Context::apply)
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// New state; partial if some nodes failed
    pub state: State,
    pub diagnostics: Diagnostics,
    pub summary: ApplySummary,
}

impl ApplyOutcome {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.has_errors()
    }
}
