use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use rtm_engine::{Coordinator, EngineConfig, Table, Verdict};
use tracing::{info, instrument, warn};

/// Git invokes the driver as `rtm merge-driver %O %A %B --marker-size %L
/// --path %P`.
#[derive(Debug, Parser)]
pub struct MergeDriver {
    /// The common ancestor (%O)
    ancestor: PathBuf,

    /// Our version (%A); the merge result is written here
    ours: PathBuf,

    /// Their version (%B)
    theirs: PathBuf,

    /// Length of conflict markers (%L)
    #[arg(long, default_value_t = 7)]
    marker_size: usize,

    /// Path of the merged file in the repository (%P)
    #[arg(long)]
    path: Option<PathBuf>,
}

impl MergeDriver {
    pub fn run(self, config: EngineConfig) -> anyhow::Result<()> {
        if !self.merge(config)? {
            std::process::exit(1);
        }
        Ok(())
    }

    /// Merges the three files into `ours`. Returns `true` when the merge
    /// is clean.
    #[instrument(skip_all, fields(path = %self.display_path()))]
    fn merge(&self, config: EngineConfig) -> anyhow::Result<bool> {
        let delimiter = config.id_delimiter;
        let base = load(&self.ancestor, delimiter)?;
        let ours = load(&self.ours, delimiter)?;
        let theirs = load(&self.theirs, delimiter)?;

        let coordinator = Coordinator::new(config);
        let (session, outcome) = coordinator.merge(&base, &ours, &theirs);
        let session = session.validate();
        if session.verdict() == Verdict::Flagged {
            warn!("merged snapshot has dependency problems; run `rtm validate`");
        }

        if outcome.is_clean() {
            session
                .save(&self.ours)
                .with_context(|| format!("failed to write {}", self.ours.display()))?;
            info!(records = outcome.table.len(), "merged cleanly");
            return Ok(true);
        }

        for conflict in &outcome.conflicts {
            warn!(%conflict, "unresolved");
        }
        std::fs::write(&self.ours, outcome.render_with_markers(self.marker_size))
            .with_context(|| format!("failed to write {}", self.ours.display()))?;
        Ok(false)
    }

    fn display_path(&self) -> String {
        self.path
            .as_deref()
            .unwrap_or(&self.ours)
            .display()
            .to_string()
    }
}

fn load(path: &Path, delimiter: char) -> anyhow::Result<Table> {
    Table::load(path, delimiter).with_context(|| format!("failed to read {}", path.display()))
}
