use anyhow::{Result, bail};
use declarative::{Graph, PlanMode};

use crate::Context;
use crate::cli::{GraphArgs, GraphKind, PlanFlags};

/// Build the requested graph
pub fn build(ctx: &Context, args: &GraphArgs) -> Result<Graph> {
    let (config, state_file) = super::load_workspace(ctx)?;
    let mode = if args.destroy {
        PlanMode::Destroy
    } else {
        PlanMode::Normal
    };
    let opts = super::plan_opts(mode, &PlanFlags::default())?;
    let engine = super::engine(ctx, Vec::new())?;

    let graph = match args.kind {
        GraphKind::Plan => engine.plan_graph(&config, &state_file.state, &opts)?,
        GraphKind::Apply => {
            let plan = engine.plan(&config, &state_file.state, &opts)?;
            if !plan.is_applyable() {
                crate::ui::print_diagnostics(&plan.diagnostics);
                bail!("Cannot build the apply graph of a plan with errors");
            }
            engine.apply_graph(&plan, &config)?
        }
    };
    log::info!("built graph with {} nodes and {} edges", graph.len(), graph.edge_count());
    Ok(graph)
}

pub fn run(ctx: &Context, args: GraphArgs) -> Result<()> {
    let graph = build(ctx, &args)?;
    print!("{}", graph.to_dot());
    Ok(())
}
