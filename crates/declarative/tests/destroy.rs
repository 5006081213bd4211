//! Destroy plans and their apply, end to end

mod common;

use common::{ApplyRecorder, addr, context, context_with, object, put, reference, resource};
use declarative::testing::MockProvider;
use declarative::{
    Action, AttributeSchema, BlockSchema, ChangeReason, Config, Context, ContextOpts, DeposedKey,
    Error, InstanceKey, Lifecycle, ModuleInstance, OutputAddr, OutputConfig, OutputValue,
    PlanOpts, ProviderConfig, ProviderConfigAddr, ProviderFactories, ProviderSchema,
    ResourceConfig, ResourceInstanceObject, State, Target,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use valuekit::Value;

fn two_objects() -> (Config, State) {
    let config = Config::new()
        .with_resource(ResourceConfig::new(addr("test_object.a")).attr("value", "a"))
        .with_resource(
            ResourceConfig::new(addr("test_object.b"))
                .attr("value", reference("test_object.a.id")),
        )
        .with_output(OutputConfig {
            addr: OutputAddr::root("a_id"),
            value: reference("test_object.a.id"),
            sensitive: false,
        });
    let mut state = State::new();
    put(&mut state, "test_object.a", ResourceInstanceObject::new(object("a", Some("a"))));
    put(
        &mut state,
        "test_object.b",
        ResourceInstanceObject::new(object("b", Some("a")))
            .with_dependencies([resource("test_object.a")]),
    );
    state.set_output(
        &OutputAddr::root("a_id"),
        OutputValue {
            value: Value::from("a"),
            sensitive: false,
        },
    );
    (config, state)
}

#[test]
fn test_destroy_runs_dependents_first() {
    let mock = Arc::new(MockProvider::new());
    let recorder = Arc::new(ApplyRecorder::default());
    let ctx = context_with(&mock, vec![recorder.clone()]);
    let (config, state) = two_objects();

    let plan = ctx.plan(&config, &state, &PlanOpts::destroy()).unwrap();
    assert!(plan.is_applyable(), "{:?}", plan.diagnostics);
    for change in &plan.changes.resources {
        assert_eq!(change.action, Action::Delete);
        assert_eq!(change.reason, Some(ChangeReason::DestroyMode));
    }
    assert_eq!(plan.changes.outputs.len(), 1);
    assert_eq!(plan.changes.outputs[0].action, Action::Delete);

    let outcome = ctx.apply(&plan, &config).unwrap();
    assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
    assert!(recorder.position("test_object.b", false) < recorder.position("test_object.a", false));
    assert!(outcome.state.is_empty());
    assert_eq!(outcome.state.root_outputs().count(), 0);
    assert_eq!(outcome.summary.deleted, 2);
}

#[test]
fn test_destroy_of_empty_state_touches_nothing() {
    let mock = Arc::new(MockProvider::new());
    let ctx = context(&mock);
    let config = Config::new()
        .with_resource(ResourceConfig::new(addr("data.test_data.d")).attr("value", "x"))
        .with_resource(
            ResourceConfig::new(addr("test_object.a"))
                .attr("value", reference("data.test_data.d.id")),
        );

    let plan = ctx.plan(&config, &State::new(), &PlanOpts::destroy()).unwrap();
    assert!(plan.changes.resources.is_empty());
    let outcome = ctx.apply(&plan, &config).unwrap();
    assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
    assert!(outcome.state.is_empty());
    assert!(mock.calls().is_empty());
}

#[test]
fn test_destroy_configures_provider_from_module_output() {
    let test = Arc::new(MockProvider::new());
    let other = Arc::new(MockProvider::with_schema(
        ProviderSchema::new()
            .with_provider(BlockSchema::new().attr("region", AttributeSchema::required()))
            .with_resource(
                "other_object",
                BlockSchema::new()
                    .attr("id", AttributeSchema::computed())
                    .attr("value", AttributeSchema::optional()),
            ),
    ));
    let ctx = Context::new(ContextOpts::with_providers(
        ProviderFactories::new()
            .register_fixed("test", test.clone())
            .register_fixed("other", other.clone()),
    ))
    .unwrap();

    let module = ModuleInstance::root().child("mod", InstanceKey::NoKey);
    let data = addr("module.mod.data.test_data.d");
    let out: OutputAddr = "module.mod.output.out".parse().unwrap();
    let config = Config::new()
        .with_resource(ResourceConfig::new(data.clone()).attr("value", "zone"))
        .with_output(OutputConfig {
            addr: out,
            value: declarative::Expr::reference("data.test_data.d.id", &module).unwrap(),
            sensitive: false,
        })
        .with_provider(ProviderConfig {
            addr: ProviderConfigAddr::root("other"),
            body: BTreeMap::from([("region".to_string(), reference("module.mod.out"))]),
        })
        .with_resource(ResourceConfig::new(addr("other_object.x")).attr("value", "x"));

    let mut state = State::new();
    state.set_current(
        &addr("other_object.x"),
        ResourceInstanceObject::new(Value::object([
            ("id", Value::from("x")),
            ("value", Value::from("x")),
        ])),
        &ProviderConfigAddr::root("other"),
    );

    let opts = PlanOpts {
        skip_refresh: true,
        ..PlanOpts::destroy()
    };
    let plan = ctx.plan(&config, &state, &opts).unwrap();
    assert!(plan.is_applyable(), "{:?}", plan.diagnostics);
    assert_eq!(
        plan.changes.resource(&addr("other_object.x"), None).unwrap().action,
        Action::Delete
    );
    assert_eq!(test.read_data_source_calls().len(), 1);
    assert!(other.read_resource_calls().is_empty());

    let outcome = ctx.apply(&plan, &config).unwrap();
    assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
    let configured = other.configure_calls();
    assert_eq!(configured.len(), 2);
    for call in configured {
        assert_eq!(call.config.attr("region"), Some(&Value::from("test_data-data")));
    }
    assert_eq!(other.apply_calls().len(), 1);
    assert!(outcome.state.is_empty());
}

#[test]
fn test_destroy_removes_tainted_deposed_objects() {
    let mock = Arc::new(MockProvider::new());
    let ctx = context(&mock);
    let config = Config::new().with_resource(
        ResourceConfig::new(addr("test_object.x"))
            .attr("value", "ok")
            .with_lifecycle(Lifecycle {
                create_before_destroy: true,
                ..Lifecycle::default()
            }),
    );
    let key = DeposedKey::generate();
    let mut state = State::new();
    state.set_deposed(
        &addr("test_object.x"),
        key.clone(),
        ResourceInstanceObject::new(object("x", Some("deposed"))).tainted(),
        &common::test_provider(),
    );

    let plan = ctx.plan(&config, &state, &PlanOpts::destroy()).unwrap();
    let change = plan.changes.resource(&addr("test_object.x"), Some(&key)).unwrap();
    assert_eq!(change.action, Action::Delete);
    assert_eq!(change.reason, Some(ChangeReason::Deposed));

    let outcome = ctx.apply(&plan, &config).unwrap();
    assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
    assert!(outcome.state.is_empty());
}

#[test]
fn test_targeted_destroy_includes_dependents() {
    let mock = Arc::new(MockProvider::new());
    let ctx = context(&mock);
    let (config, mut state) = two_objects();
    put(&mut state, "test_object.c", ResourceInstanceObject::new(object("c", None)));

    let opts = PlanOpts {
        targets: vec!["test_object.a".parse::<Target>().unwrap()],
        ..PlanOpts::destroy()
    };
    let plan = ctx.plan(&config, &state, &opts).unwrap();
    let mut destroyed: Vec<String> =
        plan.changes.actionable().map(|c| c.addr.to_string()).collect();
    destroyed.sort();
    assert_eq!(destroyed, ["test_object.a", "test_object.b"]);

    let outcome = ctx.apply(&plan, &config).unwrap();
    assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
    assert!(outcome.state.current(&addr("test_object.c")).is_some());
    assert!(outcome.state.current(&addr("test_object.a")).is_none());
}

#[test]
fn test_prevent_destroy_blocks_the_plan() {
    let mock = Arc::new(MockProvider::new());
    let ctx = context(&mock);
    let config = Config::new().with_resource(
        ResourceConfig::new(addr("test_object.a"))
            .attr("value", "a")
            .with_lifecycle(Lifecycle {
                prevent_destroy: true,
                ..Lifecycle::default()
            }),
    );
    let mut state = State::new();
    put(&mut state, "test_object.a", ResourceInstanceObject::new(object("a", Some("a"))));

    let plan = ctx.plan(&config, &state, &PlanOpts::destroy()).unwrap();
    assert!(!plan.is_applyable());
    let err = ctx.apply(&plan, &config).unwrap_err();
    assert!(matches!(err, Error::PlanNotApplyable { .. }), "{err}");
    assert!(mock.apply_calls().is_empty());
}
