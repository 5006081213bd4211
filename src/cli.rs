use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stratum")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply declarative infrastructure", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration document (default: main.json)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// State file (default: stratum.state.json)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub state: Option<PathBuf>,

    /// Maximum number of operations run at once
    #[arg(short, long, global = true, value_name = "N")]
    pub parallelism: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the changes needed to match the configuration
    Plan(PlanArgs),

    /// Make the infrastructure match the configuration
    Apply(ApplyArgs),

    /// Destroy everything recorded in state
    Destroy(DestroyArgs),

    /// Show the recorded state or a saved plan
    Show(ShowArgs),

    /// Print the dependency graph in DOT format
    Graph(GraphArgs),

    /// Check the configuration without calling any provider
    Validate,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan and Apply
// ============================================================================

/// Options shared by every command that plans
#[derive(Args, Clone, Default)]
pub struct PlanFlags {
    /// Only plan these resources and what they depend on
    #[arg(short, long = "target", value_name = "ADDRESS")]
    pub targets: Vec<String>,

    /// Do not refresh objects from their providers first
    #[arg(long)]
    pub skip_refresh: bool,
}

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub flags: PlanFlags,

    /// Plan to destroy everything in state
    #[arg(long, conflicts_with = "refresh_only")]
    pub destroy: bool,

    /// Only update state to match the real objects
    #[arg(long)]
    pub refresh_only: bool,

    /// Save the plan to a file for a later `apply`
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<PathBuf>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Saved plan to apply instead of planning again
    #[arg(value_name = "PLAN")]
    pub plan: Option<PathBuf>,

    #[command(flatten)]
    pub flags: PlanFlags,

    /// Only update state to match the real objects
    #[arg(long, conflicts_with = "plan")]
    pub refresh_only: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub auto_approve: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub flags: PlanFlags,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub auto_approve: bool,
}

// ============================================================================
// Inspection
// ============================================================================

#[derive(Args)]
pub struct ShowArgs {
    /// Saved plan to show (default: the state file)
    #[arg(value_name = "PLAN")]
    pub plan: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum GraphKind {
    /// The graph `plan` walks
    #[default]
    Plan,
    /// The graph `apply` walks for a fresh plan
    Apply,
}

#[derive(Args)]
pub struct GraphArgs {
    /// Which graph to print
    #[arg(long = "type", value_enum, default_value_t)]
    pub kind: GraphKind,

    /// Build the graph of a destroy
    #[arg(long)]
    pub destroy: bool,
}
