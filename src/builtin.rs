//! The built-in `local` provider
//!
//! `local_value` resources keep their configuration as their state and get
//! an `id` digested from the configuration they were created with. The
//! `local_digest` data source hashes its input. Nothing outside the state
//! file is touched, so configurations can be tried end to end without
//! plugins.

use anyhow::{Result, bail};
use declarative::{
    ApplyResourceChangeRequest, ApplyResourceChangeResponse, AttributeSchema, BlockSchema,
    ConfigureRequest, PlanResourceChangeRequest, PlanResourceChangeResponse, Provider,
    ProviderFactories, ProviderSchema, ReadDataSourceRequest, ReadDataSourceResponse,
};
use std::sync::{Arc, PoisonError, RwLock};
use valuekit::{Path, Value};

/// Provider type name
pub const PROVIDER_TYPE: &str = "local";

/// Number of hex digits kept in generated ids
const ID_LEN: usize = 16;

/// Register every built-in provider
pub fn factories() -> ProviderFactories {
    ProviderFactories::new().register(PROVIDER_TYPE, || {
        Ok(Arc::new(LocalProvider::new()) as Arc<dyn Provider>)
    })
}

#[derive(Debug, Default)]
pub struct LocalProvider {
    id_prefix: RwLock<String>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn id_for(&self, value: &Value) -> String {
        let prefix = self.id_prefix.read().unwrap_or_else(PoisonError::into_inner);
        let digest = digest(value);
        format!("{prefix}{}", &digest[..ID_LEN])
    }
}

/// blake3 hex digest of a value's canonical JSON
pub fn digest(value: &Value) -> String {
    // object keys are ordered, so equal values hash equally
    let json = value.to_json().to_string();
    blake3::hash(json.as_bytes()).to_hex().to_string()
}

fn id_path() -> Path {
    Path::root().key("id")
}

fn without_id(value: &Value) -> Value {
    match value {
        Value::Object(attrs) => Value::Object(
            attrs
                .iter()
                .filter(|(k, _)| k.as_str() != "id")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl Provider for LocalProvider {
    fn schema(&self) -> ProviderSchema {
        ProviderSchema::new()
            .with_provider(BlockSchema::new().attr("id_prefix", AttributeSchema::optional()))
            .with_resource(
                "local_value",
                BlockSchema::new()
                    .attr("id", AttributeSchema::computed())
                    .attr("value", AttributeSchema::optional())
                    .attr("triggers", AttributeSchema::optional())
                    .attr("sensitive_value", AttributeSchema::optional().sensitive()),
            )
            .with_data_source(
                "local_digest",
                BlockSchema::new()
                    .attr("input", AttributeSchema::required())
                    .attr("id", AttributeSchema::computed())
                    .attr("digest", AttributeSchema::computed()),
            )
    }

    fn configure(&self, req: ConfigureRequest) -> Result<()> {
        let prefix = match req.config.attr("id_prefix") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => bail!("id_prefix must be a string, got {}", other.type_name()),
        };
        *self.id_prefix.write().unwrap_or_else(PoisonError::into_inner) = prefix;
        Ok(())
    }

    fn plan_resource_change(
        &self,
        req: PlanResourceChangeRequest,
    ) -> Result<PlanResourceChangeResponse> {
        if req.type_name != "local_value" {
            bail!("unsupported resource type {:?}", req.type_name);
        }
        let Some(mut planned) = req.proposed else {
            return Ok(PlanResourceChangeResponse::default());
        };

        let requires_replace = match &req.prior {
            None => {
                planned.set(&id_path(), Value::Unknown)?;
                Vec::new()
            }
            Some(_) => vec![Path::root().key("triggers")],
        };

        Ok(PlanResourceChangeResponse {
            planned: Some(planned),
            planned_private: Vec::new(),
            requires_replace,
        })
    }

    fn apply_resource_change(
        &self,
        req: ApplyResourceChangeRequest,
    ) -> Result<ApplyResourceChangeResponse> {
        let Some(mut value) = req.planned else {
            return Ok(ApplyResourceChangeResponse::default());
        };
        if value.get(&id_path()).is_none_or(Value::is_unknown) {
            let id = self.id_for(&without_id(&value));
            value.set(&id_path(), Value::String(id))?;
        }
        Ok(ApplyResourceChangeResponse {
            new_state: Some(value),
            private: req.planned_private,
        })
    }

    fn read_data_source(&self, req: ReadDataSourceRequest) -> Result<ReadDataSourceResponse> {
        if req.type_name != "local_digest" {
            bail!("unsupported data source {:?}", req.type_name);
        }
        let input = req.config.attr("input").cloned().unwrap_or_default();
        let digest = digest(&input);
        Ok(ReadDataSourceResponse {
            state: Value::object([
                ("input", input.clone()),
                ("id", Value::String(self.id_for(&input))),
                ("digest", Value::String(digest)),
            ]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{
        AbsResourceInstance, Action, Config, Context, ContextOpts, Expr, ModuleInstance, PlanOpts,
        ProviderConfig, ProviderConfigAddr, ResourceConfig, State,
    };
    use std::collections::BTreeMap;

    fn addr(s: &str) -> AbsResourceInstance {
        s.parse().unwrap()
    }

    fn context() -> Context {
        Context::new(ContextOpts::with_providers(factories())).unwrap()
    }

    fn apply(ctx: &Context, config: &Config, state: &State) -> State {
        let plan = ctx.plan(config, state, &PlanOpts::default()).unwrap();
        assert!(plan.is_applyable(), "{:?}", plan.diagnostics);
        let outcome = ctx.apply(&plan, config).unwrap();
        assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
        outcome.state
    }

    #[test]
    fn test_digest_is_stable() {
        let a = Value::object([("x", Value::from("1")), ("y", Value::from("2"))]);
        let b = Value::object([("y", Value::from("2")), ("x", Value::from("1"))]);
        assert_eq!(digest(&a), digest(&b));
        assert_ne!(digest(&a), digest(&Value::from("1")));
        assert_eq!(digest(&a).len(), 64);
    }

    #[test]
    fn test_create_echoes_config_and_digests_id() {
        let ctx = context();
        let config = Config::new()
            .with_resource(ResourceConfig::new(addr("local_value.a")).attr("value", "hello"));

        let state = apply(&ctx, &config, &State::new());
        let obj = state.current(&addr("local_value.a")).unwrap();
        assert_eq!(obj.value.attr("value"), Some(&Value::from("hello")));

        let id = obj.value.attr("id").and_then(Value::as_str).unwrap();
        assert_eq!(id.len(), ID_LEN);
        let expected = digest(&without_id(&obj.value));
        assert_eq!(id, &expected[..ID_LEN]);
    }

    #[test]
    fn test_update_keeps_id_and_triggers_replace() {
        let ctx = context();
        let config = |value: &str, trigger: &str| {
            Config::new().with_resource(
                ResourceConfig::new(addr("local_value.a"))
                    .attr("value", value)
                    .attr("triggers", trigger),
            )
        };

        let state = apply(&ctx, &config("one", "t1"), &State::new());
        let first_id = state.current(&addr("local_value.a")).unwrap().value.attr("id").cloned();

        let plan = ctx.plan(&config("two", "t1"), &state, &PlanOpts::default()).unwrap();
        let change = plan.changes.resource(&addr("local_value.a"), None).unwrap();
        assert_eq!(change.action, Action::Update);
        let state = apply(&ctx, &config("two", "t1"), &state);
        let id = state.current(&addr("local_value.a")).unwrap().value.attr("id").cloned();
        assert_eq!(id, first_id);

        let plan = ctx.plan(&config("two", "t2"), &state, &PlanOpts::default()).unwrap();
        let change = plan.changes.resource(&addr("local_value.a"), None).unwrap();
        assert!(change.action.is_replace());
        assert_eq!(change.requires_replace, vec![Path::root().key("triggers")]);
    }

    #[test]
    fn test_id_prefix_from_provider_config() {
        let ctx = context();
        let config = Config::new()
            .with_provider(ProviderConfig {
                addr: ProviderConfigAddr::root(PROVIDER_TYPE),
                body: BTreeMap::from([("id_prefix".to_string(), Expr::from("dev-"))]),
            })
            .with_resource(ResourceConfig::new(addr("local_value.a")).attr("value", "x"));

        let state = apply(&ctx, &config, &State::new());
        let id = state.current(&addr("local_value.a")).unwrap().value.attr("id").cloned();
        let id = id.unwrap();
        assert!(id.as_str().unwrap().starts_with("dev-"), "{id}");
    }

    #[test]
    fn test_digest_data_source_feeds_resources() {
        let ctx = context();
        let config = Config::new()
            .with_resource(ResourceConfig::new(addr("data.local_digest.d")).attr("input", "seed"))
            .with_resource(
                ResourceConfig::new(addr("local_value.a")).attr(
                    "value",
                    Expr::reference("data.local_digest.d.digest", &ModuleInstance::root()).unwrap(),
                ),
            );

        let state = apply(&ctx, &config, &State::new());
        let value = state.current(&addr("local_value.a")).unwrap().value.attr("value").cloned();
        assert_eq!(value, Some(Value::String(digest(&Value::from("seed")))));
    }

    #[test]
    fn test_destroy_removes_everything() {
        let ctx = context();
        let config = Config::new()
            .with_resource(ResourceConfig::new(addr("local_value.a")).attr("value", "x"));
        let state = apply(&ctx, &config, &State::new());

        let plan = ctx.plan(&config, &state, &PlanOpts::destroy()).unwrap();
        let outcome = ctx.apply(&plan, &config).unwrap();
        assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
        assert!(outcome.state.is_empty());
    }

    #[test]
    fn test_bad_id_prefix_is_rejected() {
        let provider = LocalProvider::new();
        let err = provider
            .configure(ConfigureRequest {
                config: Value::object([("id_prefix", Value::Bool(true))]),
            })
            .unwrap_err();
        assert!(err.to_string().contains("id_prefix must be a string"));
    }
}
