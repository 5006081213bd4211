use anyhow::{Context as AnyhowContext, Result};

use crate::Context;
use crate::cli::ShowArgs;
use crate::statefile::StateFile;
use crate::ui;

pub fn run(ctx: &Context, args: ShowArgs) -> Result<()> {
    if let Some(path) = &args.plan {
        let plan = super::load_plan(path)?;
        if args.json {
            println!("{}", plan.to_json_pretty().context("Failed to serialize plan")?);
        } else {
            ui::header(&format!("Plan {}", path.display()));
            ui::print_diagnostics(&plan.diagnostics);
            ui::print_plan(&plan);
        }
        return Ok(());
    }

    let state_file = StateFile::load(&ctx.settings.state)?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&state_file).context("Failed to serialize state")?
        );
        return Ok(());
    }

    ui::header("State");
    ui::kv("File", &ctx.settings.state.display().to_string());
    ui::kv("Serial", &state_file.serial.to_string());
    ui::kv(
        "Last updated",
        &state_file.last_updated.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    println!();

    if state_file.state.is_empty() && state_file.state.root_outputs().next().is_none() {
        ui::info("The state is empty.");
        return Ok(());
    }
    for line in ui::render_state(&state_file.state) {
        println!("{line}");
    }
    Ok(())
}
