//! # Declarative
//!
//! A plan/apply engine for declarative infrastructure.
//!
//! Configuration declares resource instances; state records what exists.
//! Planning builds a dependency graph over both, refreshes every prior
//! object through its provider and diffs it against configuration. Applying
//! walks a second graph built from the plan's changes and records the
//! results into a new state snapshot.
//!
//! ## Core Concepts
//!
//! - **Provider**: foreign code that plans and applies changes for resource types
//! - **Graph**: nodes for resources, data sources, providers and outputs,
//!   walked in dependency order on a bounded worker pool
//! - **Plan**: the changes to make, plus the refreshed state they apply to
//! - **State**: current and deposed objects for every instance, plus outputs
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{Config, Context, ContextOpts, PlanOpts, ProviderFactories, State};
//!
//! let providers = ProviderFactories::new().register("test", || Ok(make_provider()));
//! let ctx = Context::new(ContextOpts::with_providers(providers))?;
//!
//! let config = Config::from_json_str(&std::fs::read_to_string("main.json")?)?;
//! let plan = ctx.plan(&config, &State::new(), &PlanOpts::default())?;
//! for change in plan.changes.actionable() {
//!     println!("{} {}", change.action.symbol(), change.display_addr());
//! }
//!
//! let outcome = ctx.apply(&plan, &config)?;
//! std::fs::write("state.json", outcome.state.to_json_pretty()?)?;
//! ```
//!
//! ## Extension Points
//!
//! - [`Provider`]: implements resource types and data sources
//! - [`Hook`]: observes refresh, diff and apply of each instance, and can halt
//!   the operation
//!
//! Node failures never abort a walk: they become [`Diagnostics`] and only
//! the failed node's dependents are skipped.

pub mod addrs;
mod applier;
pub mod builder;
pub mod conditions;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod diff;
pub mod error;
pub mod eval;
pub mod executor;
pub mod graph;
pub mod hooks;
mod planner;
pub mod provider;
pub mod reconcile;
pub mod schema;
pub mod state;
pub mod testing;
pub mod types;
mod walk;

// Re-export main types at crate root
pub use addrs::{
    AbsResourceInstance, ConfigResource, DeposedKey, InstanceKey, ModuleInstance, OutputAddr,
    ProviderConfigAddr, Resource, ResourceMode, VariableAddr,
};
pub use conditions::{Check, Condition};
pub use config::{
    Config, Expr, IgnoreChanges, Lifecycle, OutputConfig, ProviderConfig, ResourceConfig,
    VariableConfig,
};
pub use context::{Context, ContextOpts};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, Severity};
pub use error::{Error, Result};
pub use executor::{DEFAULT_PARALLELISM, NodeStatus};
pub use graph::{Graph, NodeKind};
pub use hooks::{Hook, HookAction, NoHook, StopHandle};
pub use provider::{
    ApplyResourceChangeRequest, ApplyResourceChangeResponse, ConfigureRequest,
    PlanResourceChangeRequest, PlanResourceChangeResponse, Provider, ProviderFactories,
    ProviderFactory, ReadDataSourceRequest, ReadDataSourceResponse, ReadResourceRequest,
    ReadResourceResponse,
};
pub use schema::{AttributeSchema, BlockSchema, ProviderSchema, Schemas};
pub use state::{ObjectStatus, OutputValue, ResourceInstanceObject, State};
pub use types::{
    Action, ApplyOutcome, ApplySummary, ChangeReason, Changes, OutputChange, Plan, PlanMode,
    PlanOpts, ReplaceOrder, ResourceInstanceChange, Target,
};
