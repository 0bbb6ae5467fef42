//! Orchestrates load, merge, validation and save of a snapshot.
//!
//! A [`Session`] moves through `Loaded → Validated → Saved`. Validation
//! yields a [`Verdict`]: `Clean` when the dependency graph has no cycles and
//! no reciprocity violations, `Flagged` otherwise. A flagged session can
//! still be saved; no transition discards data.

use std::{io, path::Path};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    crdt::FieldStore,
    domain::{
        Cycle, DependencyGraph, EngineConfig, ReciprocityViolation, RequirementRecord,
        RequirementSet, StatusRegression, UnknownReference, detect_regressions, reciprocity,
    },
    merge::{MergeConflict, MergeDriver, MergeOutcome},
    storage::{LoadError, Table},
};

/// Entry point to the engine, holding the configuration.
#[derive(Debug, Clone, Default)]
pub struct Coordinator {
    config: EngineConfig,
}

impl Coordinator {
    /// Creates a coordinator.
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a session on an in-memory table.
    #[must_use]
    pub fn open(&self, table: Table) -> Session<Loaded> {
        Session {
            config: self.config.clone(),
            table,
            baseline: None,
            conflicts: Vec::new(),
            state: Loaded,
        }
    }

    /// Starts a session on a CSV file.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] if the file cannot be read or parsed.
    #[instrument(skip(self))]
    pub fn load(&self, path: &Path) -> Result<Session<Loaded>, LoadError> {
        let table = Table::load(path, self.config.id_delimiter)?;
        info!(records = table.len(), "loaded snapshot");
        Ok(self.open(table))
    }

    /// Merges three snapshots and starts a session on the result.
    ///
    /// Status regressions are later reported against `base`.
    #[must_use]
    pub fn merge(
        &self,
        base: &Table,
        ours: &Table,
        theirs: &Table,
    ) -> (Session<Loaded>, MergeOutcome) {
        self.merge_with(MergeDriver::new(self.config.clone()), base, ours, theirs)
    }

    /// Like [`Coordinator::merge`], with a preconfigured driver (for
    /// instance one carrying field history).
    #[must_use]
    pub fn merge_with(
        &self,
        driver: MergeDriver,
        base: &Table,
        ours: &Table,
        theirs: &Table,
    ) -> (Session<Loaded>, MergeOutcome) {
        let outcome = driver.merge(base, ours, theirs);
        if !outcome.is_clean() {
            warn!(conflicts = outcome.conflicts.len(), "merge left conflicts");
        }
        let session = Session {
            config: self.config.clone(),
            table: outcome.table.clone(),
            baseline: Some(base.records().clone()),
            conflicts: outcome.conflicts.clone(),
            state: Loaded,
        };
        (session, outcome)
    }
}

/// A snapshot in memory, not yet validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loaded;

/// A validated snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    report: ValidationReport,
}

/// A snapshot written out.
#[derive(Debug, Clone, PartialEq)]
pub struct Saved {
    report: ValidationReport,
}

/// Whether validation found anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// No cycles and no reciprocity violations.
    Clean,
    /// At least one cycle or reciprocity violation.
    Flagged,
}

/// Everything validation found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Dependency cycles.
    pub cycles: Vec<Cycle>,
    /// Missing halves of dependency edges.
    pub reciprocity: Vec<ReciprocityViolation>,
    /// References to unknown or deleted records.
    pub unknown_references: Vec<UnknownReference>,
    /// Statuses that moved backward since the merge base.
    pub regressions: Vec<StatusRegression>,
    /// Conflicts left by the merge that produced the snapshot.
    pub conflicts: Vec<MergeConflict>,
}

impl ValidationReport {
    /// The verdict implied by this report.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        if self.cycles.is_empty() && self.reciprocity.is_empty() {
            Verdict::Clean
        } else {
            Verdict::Flagged
        }
    }
}

/// A snapshot moving through validation.
#[derive(Debug, Clone)]
pub struct Session<S> {
    config: EngineConfig,
    table: Table,
    baseline: Option<RequirementSet>,
    conflicts: Vec<MergeConflict>,
    state: S,
}

impl<S> Session<S> {
    /// The snapshot.
    #[must_use]
    pub const fn table(&self) -> &Table {
        &self.table
    }

    /// The records of the snapshot.
    #[must_use]
    pub const fn records(&self) -> &RequirementSet {
        self.table.records()
    }
}

impl Session<Loaded> {
    /// Adds every missing reciprocal edge.
    ///
    /// Returns the number of edges added.
    #[instrument(skip(self))]
    pub fn fix_reciprocity(&mut self) -> usize {
        let violations = reciprocity::check(self.table.records());
        let applied = reciprocity::apply_fixes(self.table.records_mut(), &violations);
        info!(applied, "fixed reciprocity");
        applied
    }

    /// Writes the fields a field store holds into the snapshot.
    ///
    /// Fields the store has no entry for keep their current value. Records
    /// only the store knows are added with defaults for the missing fields.
    #[instrument(skip_all, fields(replica = %store.replica()))]
    pub fn apply_store(&mut self, store: &FieldStore) {
        for (id, _) in store.state().records() {
            let mut record = self
                .table
                .records()
                .get(id)
                .cloned()
                .unwrap_or_else(|| RequirementRecord::new(id.clone()));
            store.materialize_onto(&mut record);
            self.table.records_mut().upsert(record);
        }
    }

    /// Runs the graph and reciprocity checks.
    #[instrument(skip(self), fields(records = self.table.len()))]
    #[must_use]
    pub fn validate(self) -> Session<Validated> {
        let records = self.table.records();
        let graph = DependencyGraph::build(records, &self.config.effort_column);

        let report = ValidationReport {
            cycles: graph.cycles(),
            reciprocity: reciprocity::check(records),
            unknown_references: graph.unknown_references().to_vec(),
            regressions: self.baseline.as_ref().map_or_else(Vec::new, |baseline| {
                detect_regressions(baseline, records, &self.config.status_order)
            }),
            conflicts: self.conflicts.clone(),
        };

        for cycle in &report.cycles {
            warn!(%cycle, "dependency cycle");
        }
        for reference in &report.unknown_references {
            warn!(%reference, "unknown reference");
        }
        info!(verdict = ?report.verdict(), "validated snapshot");

        Session {
            config: self.config,
            table: self.table,
            baseline: self.baseline,
            conflicts: self.conflicts,
            state: Validated { report },
        }
    }
}

impl Session<Validated> {
    /// What validation found.
    #[must_use]
    pub const fn report(&self) -> &ValidationReport {
        &self.state.report
    }

    /// The verdict.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.state.report.verdict()
    }

    /// Writes the snapshot as CSV, whatever the verdict.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write<W: io::Write>(self, writer: &mut W) -> io::Result<Session<Saved>> {
        self.table.write(writer)?;
        Ok(self.into_saved())
    }

    /// Saves the snapshot to a file, whatever the verdict.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    #[instrument(skip(self))]
    pub fn save(self, path: &Path) -> io::Result<Session<Saved>> {
        self.table.save(path)?;
        info!("saved snapshot");
        Ok(self.into_saved())
    }

    fn into_saved(self) -> Session<Saved> {
        Session {
            config: self.config,
            table: self.table,
            baseline: self.baseline,
            conflicts: self.conflicts,
            state: Saved {
                report: self.state.report,
            },
        }
    }
}

impl Session<Saved> {
    /// What validation found before saving.
    #[must_use]
    pub const fn report(&self) -> &ValidationReport {
        &self.state.report
    }
}
