//! Consistency and merge engine for requirements traceability matrices.
//!
//! A traceability matrix is a flat CSV file of requirement records kept in
//! git. This crate keeps such a file consistent when it is edited
//! concurrently: it checks the dependency graph for cycles and one-sided
//! edges, replicates per-field edits as a last-writer-wins CRDT, and merges
//! divergent branches record by record.

pub mod domain;
pub use domain::{EngineConfig, RequirementId, RequirementRecord, RequirementSet, Status};

pub mod crdt;
pub use crdt::{FieldStore, ReplicaId};

pub mod storage;
pub use storage::{LoadError, Table};

pub mod merge;
pub use merge::{MergeDriver, MergeOutcome};

pub mod coordinator;
pub use coordinator::{Coordinator, Session, ValidationReport, Verdict};
