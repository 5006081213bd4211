mod builtin;
mod cli;
mod commands;
mod progress;
mod settings;
mod statefile;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use settings::{Overrides, Settings};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub settings: Settings,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "stratum", &mut io::stdout());
        return Ok(());
    }

    let settings = Settings::load(&Overrides {
        config: cli.config,
        state: cli.state,
        parallelism: cli.parallelism,
    })?;
    if let Some(source) = &settings.source {
        log::info!("Using settings from {}", source.display());
    }

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        settings,
    };

    match cli.command {
        Command::Plan(args) => commands::plan::run(&ctx, args),
        Command::Apply(args) => commands::apply::run(&ctx, args),
        Command::Destroy(args) => commands::apply::destroy(&ctx, args),
        Command::Show(args) => commands::show::run(&ctx, args),
        Command::Graph(args) => commands::graph::run(&ctx, args),
        Command::Validate => commands::validate::run(&ctx),
        Command::Completions { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stratum",
            "apply",
            "--auto-approve",
            "-t",
            "local_value.a",
            "--state",
            "prod.json",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.state.as_deref(), Some(std::path::Path::new("prod.json")));
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert!(args.auto_approve);
        assert_eq!(args.flags.targets, ["local_value.a"]);
    }

    #[test]
    fn test_saved_plan_conflicts_with_refresh_only() {
        assert!(Cli::try_parse_from(["stratum", "apply", "plan.json", "--refresh-only"]).is_err());
        assert!(Cli::try_parse_from(["stratum", "plan", "--destroy", "--refresh-only"]).is_err());
    }
}
