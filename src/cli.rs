use std::path::PathBuf;

mod graph;
mod merge_driver;
mod terminal;
mod validate;

use anyhow::Context;
use clap::ArgAction;
use graph::Graph;
use merge_driver::MergeDriver;
use rtm_engine::EngineConfig;
use validate::Validate;

#[derive(Debug, clap::Parser)]
#[command(version, about)]
pub struct Cli {
    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true, value_name = "TOML")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        Self::setup_logging(self.verbose);

        let config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        };

        self.command.run(config)
    }

    fn setup_logging(verbosity: u8) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let level = match verbosity {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        };

        let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

        // stdout belongs to git and to report output
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_names(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run as a git merge driver
    ///
    /// Merges ANCESTOR, OURS and THEIRS record by record and writes the
    /// result into OURS. Exits with status 1 if conflicts remain.
    MergeDriver(MergeDriver),

    /// Check a snapshot for cycles and one-sided dependencies
    Validate(Validate),

    /// Show the dependency graph: cycles, order, critical path, ready work
    Graph(Graph),
}

impl Command {
    fn run(self, config: EngineConfig) -> anyhow::Result<()> {
        match self {
            Self::MergeDriver(command) => command.run(config)?,
            Self::Validate(command) => command.run(config)?,
            Self::Graph(command) => command.run(&config)?,
        }
        Ok(())
    }
}

/// How reports are printed.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parses_git_merge_driver_invocation() {
        let cli = Cli::try_parse_from([
            "rtm",
            "merge-driver",
            "%O",
            "%A",
            "%B",
            "--marker-size",
            "9",
            "--path",
            "docs/rtm.csv",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::MergeDriver(_)));
        assert!(cli.config.is_none());
    }

    #[test]
    fn verbosity_and_config_are_global() {
        let cli =
            Cli::try_parse_from(["rtm", "validate", "rtm.csv", "-vv", "--config", "rtm.toml"])
                .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("rtm.toml")));
    }

    #[test]
    fn merge_driver_needs_three_files() {
        assert!(Cli::try_parse_from(["rtm", "merge-driver", "a", "b"]).is_err());
    }
}
