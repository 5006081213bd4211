use anyhow::Result;

use crate::Context;
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    let (config, state_file) = super::load_workspace(ctx)?;
    let engine = super::engine(ctx, Vec::new())?;
    engine.validate(&config, &state_file.state)?;

    ui::success(&format!(
        "{} is valid: {} resource(s), {} output(s)",
        ctx.settings.config.display(),
        config.resources.len(),
        config.outputs.len()
    ));
    Ok(())
}
