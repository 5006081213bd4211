//! `apply` and `destroy`

use anyhow::{Result, bail};
use declarative::{Action, Config, Plan, PlanMode, ReplaceOrder};
use std::sync::Arc;

use crate::Context;
use crate::cli::{ApplyArgs, DestroyArgs};
use crate::progress::ProgressHook;
use crate::statefile::StateFile;
use crate::ui;

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let (config, mut state_file) = super::load_workspace(ctx)?;

    let (plan, saved) = match &args.plan {
        Some(path) => {
            let plan = super::load_plan(path)?;
            if plan.prev_run_state != state_file.state {
                bail!(
                    "Saved plan {} is stale: the state has changed since it was created",
                    path.display()
                );
            }
            (plan, true)
        }
        None => {
            let mode = if args.refresh_only {
                PlanMode::RefreshOnly
            } else {
                PlanMode::Normal
            };
            let opts = super::plan_opts(mode, &args.flags)?;
            (super::make_plan(ctx, &config, &state_file.state, &opts)?, false)
        }
    };

    // a saved plan was already reviewed
    let approved = args.auto_approve || saved;
    execute(ctx, &config, &mut state_file, &plan, approved, "Apply")
}

pub fn destroy(ctx: &Context, args: DestroyArgs) -> Result<()> {
    let (config, mut state_file) = super::load_workspace(ctx)?;
    let opts = super::plan_opts(PlanMode::Destroy, &args.flags)?;
    let plan = super::make_plan(ctx, &config, &state_file.state, &opts)?;
    execute(ctx, &config, &mut state_file, &plan, args.auto_approve, "Destroy")
}

/// Number of apply steps the walk reports through hooks
fn step_count(plan: &Plan) -> usize {
    plan.changes
        .actionable()
        .map(|c| match c.action {
            // the successor and the deposed original are separate steps
            Action::Replace(ReplaceOrder::CreateThenDelete) => 2,
            _ => 1,
        })
        .sum()
}

fn execute(
    ctx: &Context,
    config: &Config,
    state_file: &mut StateFile,
    plan: &Plan,
    auto_approve: bool,
    verb: &str,
) -> Result<()> {
    ui::print_plan(plan);

    if !plan.changes.is_empty() {
        println!();
        let prompt = format!("{verb} these changes?");
        if !super::confirm(&prompt, auto_approve)? {
            ui::warn(&format!("{verb} cancelled."));
            return Ok(());
        }
    }

    let progress = Arc::new(ProgressHook::applying(step_count(plan), ctx.quiet));
    let engine = super::engine(ctx, vec![progress.clone()])?;
    let outcome = engine.apply(plan, config);
    progress.finish();
    let outcome = outcome?;

    // partial results are still recorded
    state_file.save(&ctx.settings.state, outcome.state.clone())?;
    ui::print_diagnostics(&outcome.diagnostics);

    let summary = ui::render_summary(&outcome.summary);
    if outcome.has_errors() {
        ui::error(&format!("{verb} failed. {summary}"));
        bail!(
            "{}",
            outcome
                .diagnostics
                .error_summary()
                .unwrap_or_else(|| format!("{verb} failed"))
        );
    }

    println!();
    ui::success(&format!("{verb} complete! {summary}"));

    let outputs: Vec<_> = outcome.state.root_outputs().collect();
    if !outputs.is_empty() {
        ui::section("Outputs");
        for (name, output) in outputs {
            ui::kv(name, &ui::format_value(&output.value, output.sensitive));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use declarative::{PlanOpts, State};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const CONFIG: &str = r#"{
        "resources": [
            { "address": "local_value.a", "config": { "value": "hello" } },
            {
                "address": "local_value.b",
                "config": { "value": { "$ref": "local_value.a.id" } },
                "lifecycle": { "create_before_destroy": true }
            }
        ],
        "outputs": [
            { "address": "output.b_value", "value": { "$ref": "local_value.b.value" } }
        ]
    }"#;

    fn workspace(dir: &Path, config: &str) -> Context {
        fs::write(dir.join("main.json"), config).unwrap();
        Context {
            verbose: 0,
            quiet: true,
            settings: Settings {
                config: dir.join("main.json"),
                state: dir.join("stratum.state.json"),
                parallelism: 2,
                source: None,
            },
        }
    }

    fn plan_for(ctx: &Context, opts: &PlanOpts) -> (Config, StateFile, Plan) {
        let (config, state_file) = super::super::load_workspace(ctx).unwrap();
        let plan = super::super::make_plan(ctx, &config, &state_file.state, opts).unwrap();
        (config, state_file, plan)
    }

    #[test]
    fn test_apply_writes_state_and_destroy_empties_it() {
        let dir = TempDir::new().unwrap();
        let ctx = workspace(dir.path(), CONFIG);

        let (config, mut state_file, plan) = plan_for(&ctx, &PlanOpts::default());
        assert_eq!(step_count(&plan), 2);
        execute(&ctx, &config, &mut state_file, &plan, true, "Apply").unwrap();

        let saved = StateFile::load(&ctx.settings.state).unwrap();
        assert_eq!(saved.serial, 1);
        let a: declarative::AbsResourceInstance = "local_value.a".parse().unwrap();
        let b: declarative::AbsResourceInstance = "local_value.b".parse().unwrap();
        let a_id = saved.state.current(&a).unwrap().value.attr("id").cloned().unwrap();
        assert_eq!(saved.state.current(&b).unwrap().value.attr("value"), Some(&a_id));
        let out = saved.state.output(&"output.b_value".parse().unwrap()).unwrap();
        assert_eq!(out.value, a_id);

        // nothing left to do
        let (_, _, plan) = plan_for(&ctx, &PlanOpts::default());
        assert!(plan.changes.is_empty());

        let (config, mut state_file, plan) = plan_for(&ctx, &PlanOpts::destroy());
        execute(&ctx, &config, &mut state_file, &plan, true, "Destroy").unwrap();
        let saved = StateFile::load(&ctx.settings.state).unwrap();
        assert_eq!(saved.serial, 2);
        assert!(saved.state.is_empty());
        assert_eq!(saved.state.root_outputs().count(), 0);
    }

    #[test]
    fn test_replacement_counts_two_steps() {
        let dir = TempDir::new().unwrap();
        let ctx = workspace(dir.path(), CONFIG);
        let (config, mut state_file, plan) = plan_for(&ctx, &PlanOpts::default());
        execute(&ctx, &config, &mut state_file, &plan, true, "Apply").unwrap();

        // new triggers force a fresh `b`
        let changed = CONFIG.replace(
            r#""config": { "value": { "$ref": "local_value.a.id" } }"#,
            r#""config": { "value": { "$ref": "local_value.a.id" }, "triggers": "v2" }"#,
        );
        fs::write(&ctx.settings.config, changed).unwrap();
        let (_, _, plan) = plan_for(&ctx, &PlanOpts::default());
        let b = plan
            .changes
            .resource(&"local_value.b".parse().unwrap(), None)
            .unwrap();
        assert_eq!(b.action, Action::Replace(ReplaceOrder::CreateThenDelete));
        assert_eq!(step_count(&plan), 2);
    }

    #[test]
    fn test_stale_saved_plan_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = workspace(dir.path(), CONFIG);

        let (_, _, plan) = plan_for(&ctx, &PlanOpts::default());
        let plan_path = dir.path().join("saved.json");
        fs::write(&plan_path, plan.to_json_pretty().unwrap()).unwrap();

        // someone applied in the meantime
        let (config, mut state_file, fresh) = plan_for(&ctx, &PlanOpts::default());
        execute(&ctx, &config, &mut state_file, &fresh, true, "Apply").unwrap();

        let args = ApplyArgs {
            plan: Some(plan_path),
            flags: crate::cli::PlanFlags::default(),
            refresh_only: false,
            auto_approve: true,
        };
        let err = run(&ctx, args).unwrap_err();
        assert!(err.to_string().contains("is stale"), "{err}");
    }

    #[test]
    fn test_failed_plan_does_not_touch_state() {
        let dir = TempDir::new().unwrap();
        let ctx = workspace(
            dir.path(),
            r#"{
                "providers": [ { "address": "provider.local", "config": { "id_prefix": true } } ],
                "resources": [ { "address": "local_value.a", "config": { "value": "x" } } ]
            }"#,
        );
        let (config, state_file) = super::super::load_workspace(&ctx).unwrap();
        let err = super::super::make_plan(&ctx, &config, &state_file.state, &PlanOpts::default())
            .unwrap_err();
        assert!(err.to_string().contains("Planning failed"), "{err}");
        assert!(!ctx.settings.state.exists());
        assert_eq!(state_file.state, State::new());
    }
}
