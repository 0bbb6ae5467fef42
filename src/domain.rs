//! Domain models for the traceability matrix.
//!
//! This module contains the requirement record and its identifier, the
//! id-indexed record arena, engine configuration, and the dependency graph
//! checks (cycles, ordering, critical path, reciprocity).

/// Requirement identifier types and parsing.
pub mod requirement_id;
pub use requirement_id::{IdError, RequirementId};

mod requirement;
pub use requirement::{ParseEnumError, Priority, RequirementRecord, Status, StatusOrder};

mod requirement_set;
pub use requirement_set::{DuplicateId, RequirementSet, StatusRegression, detect_regressions};

mod config;
pub use config::{EngineConfig, FieldTieBreak};

/// Dependency graph analysis.
pub mod graph;
pub use graph::{
    CriticalPath, Cycle, DependencyGraph, GraphAnalysis, GraphError, ReferenceKind, Relation,
    UnknownReference,
};

pub mod reciprocity;
pub use reciprocity::{FixAction, ReciprocityViolation};
