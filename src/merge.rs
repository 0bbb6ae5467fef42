//! Semantic three-way merge of requirement snapshots.
//!
//! Records are matched by id rather than by line, so reordered rows, edits
//! to different fields of the same record, and concurrent additions merge
//! without conflicts. What cannot be decided by rule is reported as a
//! [`MergeConflict`] and, in the rendered output, wrapped in git-style
//! conflict markers.

mod driver;
pub use driver::{
    ConflictKind, MergeConflict, MergeDriver, MergeEnvelope, MergeOutcome, Resolution, Side,
};
