//! Diff Engine
//!
//! Compares a prior object with its evaluated configuration and asks the
//! provider for the planned new value. The action follows from the prior
//! object, the planned value and what the provider says requires
//! replacement:
//!
//! | prior        | planned vs prior                  | action             |
//! |--------------|-----------------------------------|--------------------|
//! | none         | -                                 | create             |
//! | tainted      | -                                 | replace            |
//! | present      | differs in a requires-replace path| replace            |
//! | present      | differs                           | update             |
//! | present      | equal, marks differ               | update             |
//! | present      | equal                             | no-op              |
//!
//! Unknown leaves in the planned value are kept as they are. Sensitivity
//! marks are the union of the configuration's, the prior object's and the
//! schema's, pruned to paths present in the value.

use crate::addrs::{AbsResourceInstance, DeposedKey, ProviderConfigAddr};
use crate::config::{IgnoreChanges, Lifecycle};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::provider::{PlanResourceChangeRequest, PlanResourceChangeResponse, Provider};
use crate::schema::BlockSchema;
use crate::state::ResourceInstanceObject;
use crate::types::{Action, ChangeReason, ReplaceOrder, ResourceInstanceChange};
use valuekit::{MarkedValue, Path, PathSet, Value};

/// Everything needed to diff one current object against configuration
pub struct ResourceDiff<'a> {
    pub addr: &'a AbsResourceInstance,
    pub provider: &'a ProviderConfigAddr,
    pub schema: &'a BlockSchema,
    pub lifecycle: &'a Lifecycle,
    /// Refreshed prior object, if any
    pub prior: Option<&'a ResourceInstanceObject>,
    /// Evaluated configuration with its marks
    pub config: &'a MarkedValue,
}

/// The value proposed to the provider: configuration, with computed
/// attributes the configuration leaves null carried over from `prior`
pub fn proposed_value(schema: &BlockSchema, prior: Option<&Value>, config: &Value) -> Value {
    let mut proposed = schema.normalize(config.clone());
    let (Some(prior), Value::Object(attrs)) = (prior, &mut proposed) else {
        return proposed;
    };
    for (name, attr) in &schema.attributes {
        if !attr.computed {
            continue;
        }
        let Some(slot) = attrs.get_mut(name) else {
            continue;
        };
        if slot.is_null()
            && let Some(prior_value) = prior.attr(name)
        {
            *slot = prior_value.clone();
        }
    }
    proposed
}

/// Replace ignored paths of `proposed` with the prior value
pub fn apply_ignore_changes(ignore: &IgnoreChanges, prior: &Value, proposed: Value) -> Value {
    match ignore {
        IgnoreChanges::Nothing => proposed,
        IgnoreChanges::All => match proposed {
            Value::Object(mut attrs) => {
                for (name, value) in &mut attrs {
                    if let Some(p) = prior.attr(name) {
                        value.clone_from(p);
                    }
                }
                Value::Object(attrs)
            }
            other => other,
        },
        IgnoreChanges::Paths(paths) => {
            let mut out = proposed;
            for path in paths {
                let Some(p) = prior.get(path) else {
                    continue;
                };
                if let Err(err) = out.set(path, p.clone()) {
                    log::debug!("ignore_changes path {path} not applicable: {err}");
                }
            }
            out
        }
    }
}

/// True if the two values are equal, treating missing object keys as null
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a.diff_paths(b).is_empty()
}

fn marks_for(value: &Value, sources: &[&PathSet]) -> PathSet {
    let mut marks = PathSet::new();
    for source in sources {
        marks.extend_from(source);
    }
    marks.retain_present(value);
    marks
}

fn plan_call(
    provider: &dyn Provider,
    addr: &AbsResourceInstance,
    req: PlanResourceChangeRequest,
) -> Result<PlanResourceChangeResponse, Diagnostic> {
    provider
        .plan_resource_change(req)
        .map_err(|err| Diagnostic::provider("plan", &err).with_subject(addr))
}

fn invalid_plan(addr: &AbsResourceInstance) -> Diagnostic {
    Diagnostic::error(
        DiagnosticKind::InvalidResult,
        "Provider produced invalid plan",
        format!("The provider returned no planned value for {addr}"),
    )
    .with_subject(addr)
}

fn prevent_destroy(addr: &AbsResourceInstance) -> Diagnostic {
    Diagnostic::error(
        DiagnosticKind::Configuration,
        "Instance cannot be destroyed",
        format!(
            "Resource {addr} has lifecycle.prevent_destroy set, \
             but the plan calls for this resource to be destroyed"
        ),
    )
    .with_subject(addr)
}

/// Plan the change for a configured current object.
///
/// Returns no change if planning failed; the reasons are in the
/// diagnostics.
pub fn diff_resource(
    provider: &dyn Provider,
    diff: &ResourceDiff<'_>,
) -> (Option<ResourceInstanceChange>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let addr = diff.addr;

    let missing = diff.schema.missing_required(&diff.config.value);
    if !missing.is_empty() {
        for name in missing {
            diags.push(
                Diagnostic::error(
                    DiagnosticKind::Configuration,
                    "Missing required argument",
                    format!("The argument {name:?} is required, but no definition was found"),
                )
                .with_subject(addr),
            );
        }
        return (None, diags);
    }

    let schema_marks = diff.schema.sensitive_paths();
    let config_value = diff.schema.normalize(diff.config.value.clone());
    let prior = diff.prior.map(|obj| {
        let value = diff.schema.normalize(obj.value.clone());
        let marks = marks_for(&value, &[&obj.sensitive_paths, &schema_marks]);
        (obj, value, marks)
    });
    let live_prior = prior.as_ref().filter(|(obj, ..)| !obj.is_tainted());

    let mut proposed = proposed_value(diff.schema, live_prior.map(|(_, v, _)| v), &config_value);
    if let Some((_, prior_value, _)) = live_prior {
        proposed = apply_ignore_changes(&diff.lifecycle.ignore_changes, prior_value, proposed);
    }

    let resp = match plan_call(
        provider,
        addr,
        PlanResourceChangeRequest {
            type_name: addr.resource.type_name.clone(),
            prior: live_prior.map(|(_, v, _)| v.clone()),
            proposed: Some(proposed),
            config: Some(config_value.clone()),
            prior_private: live_prior.map(|(o, ..)| o.private.clone()).unwrap_or_default(),
        },
    ) {
        Ok(resp) => resp,
        Err(diag) => {
            diags.push(diag);
            return (None, diags);
        }
    };
    let Some(planned) = resp.planned.clone() else {
        diags.push(invalid_plan(addr));
        return (None, diags);
    };

    let order = if diff.lifecycle.create_before_destroy {
        ReplaceOrder::CreateThenDelete
    } else {
        ReplaceOrder::DeleteThenCreate
    };

    let mut requires_replace = Vec::new();
    let (action, reason, planned, private) = match &prior {
        None => (Action::Create, None, planned, resp.planned_private),
        Some((obj, ..)) if obj.is_tainted() => (
            Action::Replace(order),
            Some(ChangeReason::Tainted),
            planned,
            resp.planned_private,
        ),
        Some((_, prior_value, prior_marks)) => {
            requires_replace = resp
                .requires_replace
                .iter()
                .filter(|p| !values_equal(
                    prior_value.get(p).unwrap_or(&Value::Null),
                    planned.get(p).unwrap_or(&Value::Null),
                ))
                .cloned()
                .collect::<Vec<Path>>();

            if requires_replace.is_empty() {
                let after_marks =
                    marks_for(&planned, &[&diff.config.marks, prior_marks, &schema_marks]);
                if !values_equal(prior_value, &planned) {
                    (Action::Update, None, planned, resp.planned_private)
                } else if &after_marks != prior_marks {
                    (
                        Action::Update,
                        Some(ChangeReason::SensitivityChanged),
                        planned,
                        resp.planned_private,
                    )
                } else {
                    (Action::NoOp, None, planned, resp.planned_private)
                }
            } else {
                // plan the successor as a fresh object
                let fresh = proposed_value(diff.schema, None, &config_value);
                let create = match plan_call(
                    provider,
                    addr,
                    PlanResourceChangeRequest {
                        type_name: addr.resource.type_name.clone(),
                        prior: None,
                        proposed: Some(fresh),
                        config: Some(config_value.clone()),
                        prior_private: Vec::new(),
                    },
                ) {
                    Ok(resp) => resp,
                    Err(diag) => {
                        diags.push(diag);
                        return (None, diags);
                    }
                };
                let Some(planned) = create.planned else {
                    diags.push(invalid_plan(addr));
                    return (None, diags);
                };
                (
                    Action::Replace(order),
                    Some(ChangeReason::RequiresReplace),
                    planned,
                    create.planned_private,
                )
            }
        }
    };

    if action.destroys() && diff.lifecycle.prevent_destroy {
        diags.push(prevent_destroy(addr));
    }

    let empty = PathSet::new();
    let prior_marks = prior.as_ref().map_or(&empty, |(_, _, m)| m);
    let after_sensitive = marks_for(&planned, &[&diff.config.marks, prior_marks, &schema_marks]);

    log::debug!("planned {action} for {addr}");
    let change = ResourceInstanceChange {
        addr: addr.clone(),
        deposed: None,
        provider: diff.provider.clone(),
        action,
        reason,
        before: prior.as_ref().map(|(_, v, _)| v.clone()),
        after: Some(planned),
        before_sensitive: prior_marks.clone(),
        after_sensitive,
        private,
        requires_replace,
    };
    (Some(change), diags)
}

/// Plan the delete of a current or deposed object, letting the provider
/// attach private data for the destroy
#[allow(clippy::too_many_arguments)]
pub fn diff_destroy(
    provider: &dyn Provider,
    addr: &AbsResourceInstance,
    provider_addr: &ProviderConfigAddr,
    deposed: Option<&DeposedKey>,
    prior: &ResourceInstanceObject,
    schema: Option<&BlockSchema>,
    reason: ChangeReason,
    prevent: bool,
) -> (Option<ResourceInstanceChange>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let schema_marks = schema.map(BlockSchema::sensitive_paths).unwrap_or_default();

    let resp = match plan_call(
        provider,
        addr,
        PlanResourceChangeRequest {
            type_name: addr.resource.type_name.clone(),
            prior: Some(prior.value.clone()),
            proposed: None,
            config: None,
            prior_private: prior.private.clone(),
        },
    ) {
        Ok(resp) => resp,
        Err(diag) => {
            diags.push(diag);
            return (None, diags);
        }
    };
    if resp.planned.as_ref().is_some_and(|v| !v.is_null()) {
        diags.push(
            Diagnostic::error(
                DiagnosticKind::InvalidResult,
                "Provider produced invalid plan",
                format!("The provider planned a non-null value while destroying {addr}"),
            )
            .with_subject(addr),
        );
        return (None, diags);
    }
    if prevent && deposed.is_none() {
        diags.push(prevent_destroy(addr));
    }

    log::debug!("planned delete for {addr}");
    let change = ResourceInstanceChange {
        addr: addr.clone(),
        deposed: deposed.cloned(),
        provider: provider_addr.clone(),
        action: Action::Delete,
        reason: Some(reason),
        before: Some(prior.value.clone()),
        after: None,
        before_sensitive: marks_for(&prior.value, &[&prior.sensitive_paths, &schema_marks]),
        after_sensitive: PathSet::new(),
        private: resp.planned_private,
        requires_replace: Vec::new(),
    };
    (Some(change), diags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProvider, default_schema};
    use valuekit::PathSet;

    fn schema() -> BlockSchema {
        default_schema().resource_types["test_object"].clone()
    }

    fn addr() -> AbsResourceInstance {
        AbsResourceInstance::managed("test_object", "a")
    }

    fn run(
        p: &MockProvider,
        lifecycle: &Lifecycle,
        prior: Option<&ResourceInstanceObject>,
        config: &MarkedValue,
    ) -> (Option<ResourceInstanceChange>, Diagnostics) {
        let schema = schema();
        let addr = addr();
        let provider = ProviderConfigAddr::root("test");
        diff_resource(
            p,
            &ResourceDiff {
                addr: &addr,
                provider: &provider,
                schema: &schema,
                lifecycle,
                prior,
                config,
            },
        )
    }

    fn config(value: &str) -> MarkedValue {
        MarkedValue::unmarked(Value::object([("value", Value::string(value))]))
    }

    fn prior(value: &str) -> ResourceInstanceObject {
        ResourceInstanceObject::new(Value::object([
            ("id", Value::string("a1")),
            ("value", Value::string(value)),
            ("output", Value::string("out")),
        ]))
    }

    #[test]
    fn test_create_keeps_unknowns() {
        let p = MockProvider::new();
        let (change, diags) = run(&p, &Lifecycle::default(), None, &config("x"));
        assert!(diags.is_empty());
        let change = change.unwrap();
        assert_eq!(change.action, Action::Create);
        let after = change.after.unwrap();
        assert!(after.attr("id").unwrap().is_unknown());
        assert_eq!(after.attr("value"), Some(&Value::string("x")));
    }

    #[test]
    fn test_noop_when_only_computed_attrs_are_absent_from_config() {
        let p = MockProvider::new();
        let prior = prior("x");
        let (change, _) = run(&p, &Lifecycle::default(), Some(&prior), &config("x"));
        let change = change.unwrap();
        assert_eq!(change.action, Action::NoOp);
        assert_eq!(change.after.unwrap().attr("id"), Some(&Value::string("a1")));
    }

    #[test]
    fn test_update_and_replace() {
        let p = MockProvider::new();
        let prior = prior("x");
        let (change, _) = run(&p, &Lifecycle::default(), Some(&prior), &config("y"));
        assert_eq!(change.unwrap().action, Action::Update);

        let cfg = MarkedValue::unmarked(Value::object([
            ("value", Value::string("x")),
            ("require_new", Value::string("new")),
        ]));
        let lifecycle = Lifecycle {
            create_before_destroy: true,
            ..Lifecycle::default()
        };
        let (change, _) = run(&p, &lifecycle, Some(&prior), &cfg);
        let change = change.unwrap();
        assert_eq!(change.action, Action::Replace(ReplaceOrder::CreateThenDelete));
        assert_eq!(change.reason, Some(ChangeReason::RequiresReplace));
        assert_eq!(change.requires_replace, vec![Path::root().key("require_new")]);
        // successor is planned from scratch
        assert!(change.after.unwrap().attr("id").unwrap().is_unknown());
    }

    #[test]
    fn test_tainted_prior_is_replaced() {
        let p = MockProvider::new();
        let prior = prior("x").tainted();
        let (change, _) = run(&p, &Lifecycle::default(), Some(&prior), &config("x"));
        let change = change.unwrap();
        assert_eq!(change.action, Action::Replace(ReplaceOrder::DeleteThenCreate));
        assert_eq!(change.reason, Some(ChangeReason::Tainted));
        assert_eq!(p.plan_calls()[0].prior, None);
    }

    #[test]
    fn test_ignore_changes_masks_diff() {
        let p = MockProvider::new();
        let prior = prior("x");
        let lifecycle = Lifecycle {
            ignore_changes: IgnoreChanges::Paths(vec![Path::root().key("value")]),
            ..Lifecycle::default()
        };
        let (change, _) = run(&p, &lifecycle, Some(&prior), &config("changed"));
        assert_eq!(change.unwrap().action, Action::NoOp);

        let lifecycle = Lifecycle {
            ignore_changes: IgnoreChanges::All,
            ..Lifecycle::default()
        };
        let (change, _) = run(&p, &lifecycle, Some(&prior), &config("changed"));
        assert_eq!(change.unwrap().action, Action::NoOp);
    }

    #[test]
    fn test_marks_are_unioned_once() {
        let p = MockProvider::new();
        let secret_path = Path::root().key("value");
        let marked = config("x").with_marks(&PathSet::from_iter([secret_path.clone()]));

        let (change, _) = run(&p, &Lifecycle::default(), Some(&prior("x")), &marked);
        let change = change.unwrap();
        assert_eq!(change.action, Action::Update);
        assert_eq!(change.reason, Some(ChangeReason::SensitivityChanged));
        assert!(change.after_sensitive.contains(&secret_path));
        assert!(change.after_sensitive.contains(&Path::root().key("secret")));

        let stored = prior("x").with_sensitive_paths(change.after_sensitive.clone());
        let (change, _) = run(&p, &Lifecycle::default(), Some(&stored), &marked);
        let change = change.unwrap();
        assert_eq!(change.action, Action::NoOp);
        assert_eq!(change.after_sensitive, change.before_sensitive);
    }

    #[test]
    fn test_prevent_destroy_blocks_replace() {
        let p = MockProvider::new();
        let lifecycle = Lifecycle {
            prevent_destroy: true,
            ..Lifecycle::default()
        };
        let (_, diags) = run(&p, &lifecycle, Some(&prior("x").tainted()), &config("x"));
        assert!(diags.has_errors());
        assert_eq!(diags.errors().next().unwrap().summary, "Instance cannot be destroyed");
    }

    #[test]
    fn test_missing_required_attribute() {
        let p = MockProvider::new();
        let schema = BlockSchema::new().attr("name", crate::schema::AttributeSchema::required());
        let addr = addr();
        let provider = ProviderConfigAddr::root("test");
        let (change, diags) = diff_resource(
            &p,
            &ResourceDiff {
                addr: &addr,
                provider: &provider,
                schema: &schema,
                lifecycle: &Lifecycle::default(),
                prior: None,
                config: &MarkedValue::unmarked(Value::empty_object()),
            },
        );
        assert!(change.is_none());
        assert_eq!(diags.of_kind(DiagnosticKind::Configuration).count(), 1);
        assert!(p.plan_calls().is_empty());
    }

    #[test]
    fn test_destroy_carries_private_data() {
        let p = MockProvider::new();
        p.set_plan(|_| {
            Ok(PlanResourceChangeResponse {
                planned: None,
                planned_private: b"planned".to_vec(),
                requires_replace: Vec::new(),
            })
        });
        let schema = schema();
        let (change, diags) = diff_destroy(
            &p,
            &addr(),
            &ProviderConfigAddr::root("test"),
            None,
            &prior("x"),
            Some(&schema),
            ChangeReason::DestroyMode,
            false,
        );
        assert!(diags.is_empty());
        let change = change.unwrap();
        assert_eq!(change.action, Action::Delete);
        assert_eq!(change.private, b"planned");
        assert_eq!(change.after, None);
    }
}
