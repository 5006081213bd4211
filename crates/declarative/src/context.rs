//! Operation entry points
//!
//! A [`Context`] owns the provider factories and their schemas, and runs
//! plan and apply operations against a configuration and a state snapshot.

use crate::applier::Applier;
use crate::builder::{apply_graph, plan_graph};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::DEFAULT_PARALLELISM;
use crate::graph::Graph;
use crate::hooks::{Hook, Hooks, StopHandle};
use crate::planner::Planner;
use crate::provider::ProviderFactories;
use crate::schema::Schemas;
use crate::state::State;
use crate::types::{ApplyOutcome, Plan, PlanOpts};
use std::sync::Arc;

/// Options for [`Context::new`]
#[derive(Clone)]
pub struct ContextOpts {
    pub providers: ProviderFactories,
    pub hooks: Vec<Arc<dyn Hook>>,
    /// Maximum number of nodes visited at once
    pub parallelism: usize,
    /// Shared cancellation flag; [`Context::stop`] sets it
    pub stop: StopHandle,
}

impl Default for ContextOpts {
    fn default() -> Self {
        Self {
            providers: ProviderFactories::new(),
            hooks: Vec::new(),
            parallelism: DEFAULT_PARALLELISM,
            stop: StopHandle::new(),
        }
    }
}

impl ContextOpts {
    pub fn with_providers(providers: ProviderFactories) -> Self {
        Self {
            providers,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }
}

/// Runs plan and apply operations
pub struct Context {
    factories: ProviderFactories,
    schemas: Schemas,
    hooks: Hooks,
    parallelism: usize,
    stop: StopHandle,
}

impl Context {
    /// Create a context, loading the schema of every registered provider
    pub fn new(opts: ContextOpts) -> Result<Self> {
        let mut schemas = Schemas::new();
        for name in opts.providers.names() {
            let Some(factory) = opts.providers.get(name) else {
                continue;
            };
            let provider = factory().map_err(|e| {
                Error::configuration(format!("failed to instantiate provider {name:?}: {e:#}"))
            })?;
            schemas.insert(name, provider.schema());
            log::debug!("loaded schema for provider {name:?}");
        }

        Ok(Self {
            hooks: Hooks::new(opts.hooks, opts.stop.clone()),
            factories: opts.providers,
            schemas,
            parallelism: opts.parallelism.max(1),
            stop: opts.stop,
        })
    }

    pub fn schemas(&self) -> &Schemas {
        &self.schemas
    }

    /// Handle that cancels running operations from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop scheduling new nodes; running provider calls finish
    pub fn stop(&self) {
        log::info!("stop requested");
        self.stop.stop();
    }

    /// Compute the changes needed to make `state` match `config`.
    ///
    /// Errors found while walking are returned in [`Plan::diagnostics`];
    /// only problems that prevent the walk from starting are an `Err`.
    pub fn plan(&self, config: &Config, state: &State, opts: &PlanOpts) -> Result<Plan> {
        let graph = self.plan_graph(config, state, opts)?;
        Planner::new(config, &self.schemas, &self.factories, &self.hooks, state, opts)
            .run(&graph, self.parallelism, &self.stop)
    }

    /// Carry out `plan`. The configuration must be the one it was made from.
    pub fn apply(&self, plan: &Plan, config: &Config) -> Result<ApplyOutcome> {
        if !plan.is_applyable() {
            return Err(Error::PlanNotApplyable {
                reason: plan
                    .diagnostics
                    .error_summary()
                    .unwrap_or_else(|| "the plan has errors".to_string()),
            });
        }
        let graph = self.apply_graph(plan, config)?;
        Applier::new(config, &self.schemas, &self.factories, &self.hooks, plan).run(
            &graph,
            self.parallelism,
            &self.stop,
        )
    }

    /// Check that a plan graph can be built without calling any provider
    pub fn validate(&self, config: &Config, state: &State) -> Result<()> {
        self.plan_graph(config, state, &PlanOpts::default()).map(|_| ())
    }

    pub fn plan_graph(&self, config: &Config, state: &State, opts: &PlanOpts) -> Result<Graph> {
        plan_graph(config, state, opts, &self.factories, &self.schemas)
    }

    pub fn apply_graph(&self, plan: &Plan, config: &Config) -> Result<Graph> {
        apply_graph(config, plan, &self.factories, &self.schemas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::AbsResourceInstance;
    use crate::config::ResourceConfig;
    use crate::provider::Provider;
    use crate::testing::MockProvider;
    use crate::types::Action;

    fn context(mock: &Arc<MockProvider>) -> Context {
        Context::new(ContextOpts::with_providers(
            ProviderFactories::new().register_fixed("test", mock.clone()),
        ))
        .unwrap()
    }

    #[test]
    fn test_plan_then_apply() {
        let mock = Arc::new(MockProvider::new());
        let ctx = context(&mock);
        let addr = AbsResourceInstance::managed("test_object", "a");
        let config =
            Config::new().with_resource(ResourceConfig::new(addr.clone()).attr("value", "v"));

        let plan = ctx.plan(&config, &State::new(), &PlanOpts::default()).unwrap();
        assert_eq!(plan.changes.resource(&addr, None).unwrap().action, Action::Create);

        let outcome = ctx.apply(&plan, &config).unwrap();
        assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
        assert_eq!(outcome.summary.created, 1);
        let stored = outcome.state.current(&addr).unwrap();
        assert_eq!(stored.value.attr("id"), Some(&valuekit::Value::string("test_object-0")));
        assert_eq!(stored.value.attr("output"), Some(&valuekit::Value::Null));
    }

    #[test]
    fn test_schemas_loaded_from_factories() {
        let mock = Arc::new(MockProvider::new());
        let ctx = context(&mock);
        assert!(ctx.schemas().provider("test").is_some());
        assert_eq!(mock.configure_count(), 0);
    }

    #[test]
    fn test_failing_factory_is_reported() {
        let factories =
            ProviderFactories::new().register("broken", || -> anyhow::Result<Arc<dyn Provider>> {
                anyhow::bail!("no binary")
            });
        let err = Context::new(ContextOpts::with_providers(factories)).err().unwrap();
        assert!(err.to_string().contains("no binary"));
    }

    #[test]
    fn test_plan_with_errors_is_not_applyable() {
        let mock = Arc::new(MockProvider::new());
        mock.set_plan(|_| anyhow::bail!("quota exceeded"));
        let ctx = context(&mock);
        let config = Config::new()
            .with_resource(ResourceConfig::new(AbsResourceInstance::managed("test_object", "a")));
        let plan = ctx.plan(&config, &State::new(), &PlanOpts::default()).unwrap();
        assert!(!plan.is_applyable());
        let err = ctx.apply(&plan, &config).unwrap_err();
        assert!(matches!(err, Error::PlanNotApplyable { .. }));
        assert!(err.to_string().contains("quota exceeded"));
    }
}
