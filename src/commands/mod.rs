//! Command implementations
//!
//! Every command loads the configuration document and the state file named
//! by the resolved settings, then drives a [`declarative::Context`] built
//! with the built-in providers.

pub mod apply;
pub mod graph;
pub mod plan;
pub mod show;
pub mod validate;

use anyhow::{Context as AnyhowContext, Result, bail};
use declarative::{
    Config, Context as Engine, ContextOpts, Hook, Plan, PlanMode, PlanOpts, State, Target,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::Context;
use crate::builtin;
use crate::cli::PlanFlags;
use crate::progress::ProgressHook;
use crate::statefile::StateFile;
use crate::ui;

/// Read and parse the configuration document
pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration: {}", path.display()))?;
    let config = Config::from_json_str(&content)
        .with_context(|| format!("Invalid configuration: {}", path.display()))?;
    log::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Read and parse a saved plan
pub fn load_plan(path: &Path) -> Result<Plan> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan: {}", path.display()))?;
    Plan::from_json_str(&content).with_context(|| format!("Invalid plan file: {}", path.display()))
}

/// Configuration and state, as every command starts
pub fn load_workspace(ctx: &Context) -> Result<(Config, StateFile)> {
    let config = load_config(&ctx.settings.config)?;
    let state = StateFile::load(&ctx.settings.state)?;
    Ok((config, state))
}

/// Build an engine context with the built-in providers
pub fn engine(ctx: &Context, hooks: Vec<Arc<dyn Hook>>) -> Result<Engine> {
    let mut opts = ContextOpts::with_providers(builtin::factories());
    opts.parallelism = ctx.settings.parallelism;
    for hook in hooks {
        opts = opts.hook(hook);
    }
    Engine::new(opts).context("Failed to initialize providers")
}

pub fn plan_opts(mode: PlanMode, flags: &PlanFlags) -> Result<PlanOpts> {
    let targets = flags
        .targets
        .iter()
        .map(|t| {
            t.parse::<Target>()
                .with_context(|| format!("Invalid target address: {t}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PlanOpts {
        mode,
        skip_refresh: flags.skip_refresh,
        targets,
    })
}

/// Plan with a spinner, reporting diagnostics. Fails if the plan has errors.
pub fn make_plan(ctx: &Context, config: &Config, state: &State, opts: &PlanOpts) -> Result<Plan> {
    let progress = Arc::new(ProgressHook::planning(ctx.quiet));
    let engine = engine(ctx, vec![progress.clone()])?;
    let plan = engine.plan(config, state, opts);
    progress.finish();
    let plan = plan?;

    ui::print_diagnostics(&plan.diagnostics);
    if !plan.is_applyable() {
        bail!("Planning failed with {} error(s)", plan.diagnostics.errors().count());
    }
    if plan.targeted {
        ui::warn("Only part of the configuration was planned because targets were given.");
    }
    Ok(plan)
}

/// Ask before making changes
pub fn confirm(prompt: &str, auto_approve: bool) -> Result<bool> {
    if auto_approve {
        return Ok(true);
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Failed to read confirmation (use --auto-approve when not running interactively)")
}
