use anyhow::{Context as AnyhowContext, Result};
use declarative::PlanMode;
use std::fs;

use crate::Context;
use crate::cli::PlanArgs;
use crate::ui;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let (config, state_file) = super::load_workspace(ctx)?;
    let mode = if args.destroy {
        PlanMode::Destroy
    } else if args.refresh_only {
        PlanMode::RefreshOnly
    } else {
        PlanMode::Normal
    };
    let opts = super::plan_opts(mode, &args.flags)?;

    let plan = super::make_plan(ctx, &config, &state_file.state, &opts)?;
    ui::print_plan(&plan);
    if ctx.verbose > 0 {
        let unchanged = plan.changes.resources.len() - plan.changes.actionable().count();
        ui::dim(&format!("{unchanged} instance(s) unchanged"));
    }

    if let Some(out) = args.out {
        let content = plan.to_json_pretty().context("Failed to serialize plan")?;
        fs::write(&out, content)
            .with_context(|| format!("Failed to write plan: {}", out.display()))?;
        println!();
        ui::info(&format!(
            "Saved the plan to {}. Run `stratum apply {}` to carry it out.",
            out.display(),
            out.display()
        ));
    }
    Ok(())
}
