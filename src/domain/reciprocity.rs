//! Checks that `dependencies` and `blocks` mirror each other.
//!
//! `A ∈ B.dependencies` must hold exactly when `B ∈ A.blocks`. Violations
//! are reported with the single edge insertion that restores symmetry.
//! Fixes only ever add ids; nothing is removed.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::domain::{RequirementId, RequirementSet};

/// The edge insertion that repairs a violation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FixAction {
    /// Add `blocked` to the `blocks` column of `on`.
    AddBlock {
        /// The prerequisite record to edit.
        on: RequirementId,
        /// The id to add.
        blocked: RequirementId,
    },
    /// Add `requires` to the `dependencies` column of `on`.
    AddDependency {
        /// The dependent record to edit.
        on: RequirementId,
        /// The id to add.
        requires: RequirementId,
    },
}

impl fmt::Display for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddBlock { on, blocked } => write!(f, "add {blocked} to {on}.blocks"),
            Self::AddDependency { on, requires } => {
                write!(f, "add {requires} to {on}.dependencies")
            }
        }
    }
}

/// One half of a dependency edge is missing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Error)]
#[error("{dependent} and {prerequisite} disagree about their dependency; suggested fix: {fix}")]
pub struct ReciprocityViolation {
    /// The record that needs the other.
    pub dependent: RequirementId,
    /// The record that is needed.
    pub prerequisite: RequirementId,
    /// The suggested repair.
    pub fix: FixAction,
}

/// Finds every reciprocity violation between live records.
///
/// References to missing or tombstoned records are not violations here;
/// the graph engine reports them as unknown references. Self references are
/// reported as cycles, not here.
#[instrument(level = "debug", skip(set), fields(records = set.len()))]
#[must_use]
pub fn check(set: &RequirementSet) -> Vec<ReciprocityViolation> {
    let mut violations = Vec::new();

    for record in set.live() {
        for prerequisite_id in &record.dependencies {
            if *prerequisite_id == record.id {
                continue;
            }
            let Some(prerequisite) = set.get(prerequisite_id).filter(|r| r.is_live()) else {
                continue;
            };
            if !prerequisite.blocks.contains(&record.id) {
                violations.push(ReciprocityViolation {
                    dependent: record.id.clone(),
                    prerequisite: prerequisite.id.clone(),
                    fix: FixAction::AddBlock {
                        on: prerequisite.id.clone(),
                        blocked: record.id.clone(),
                    },
                });
            }
        }

        for dependent_id in &record.blocks {
            if *dependent_id == record.id {
                continue;
            }
            let Some(dependent) = set.get(dependent_id).filter(|r| r.is_live()) else {
                continue;
            };
            if !dependent.dependencies.contains(&record.id) {
                violations.push(ReciprocityViolation {
                    dependent: dependent.id.clone(),
                    prerequisite: record.id.clone(),
                    fix: FixAction::AddDependency {
                        on: dependent.id.clone(),
                        requires: record.id.clone(),
                    },
                });
            }
        }
    }

    violations.sort();
    violations
}

/// Applies the suggested fixes.
///
/// Returns the number of ids actually inserted. Fixes naming records that
/// no longer exist are skipped.
pub fn apply_fixes<'a>(
    set: &mut RequirementSet,
    violations: impl IntoIterator<Item = &'a ReciprocityViolation>,
) -> usize {
    let mut applied = 0;

    for violation in violations {
        let inserted = match &violation.fix {
            FixAction::AddBlock { on, blocked } => set
                .get_mut(on)
                .is_some_and(|record| record.blocks.insert(blocked.clone())),
            FixAction::AddDependency { on, requires } => set
                .get_mut(on)
                .is_some_and(|record| record.dependencies.insert(requires.clone())),
        };
        if inserted {
            debug!(fix = %violation.fix, "applied reciprocity fix");
            applied += 1;
        }
    }

    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequirementRecord;

    fn id(s: &str) -> RequirementId {
        s.parse().unwrap()
    }

    fn record(s: &str) -> RequirementRecord {
        RequirementRecord::new(id(s))
    }

    fn edge_count(set: &RequirementSet) -> usize {
        set.iter()
            .map(|record| record.dependencies.len() + record.blocks.len())
            .sum()
    }

    #[test]
    fn reciprocal_store_is_clean() {
        let set = RequirementSet::from_records([
            record("REQ-X-001").depends_on(id("REQ-X-002")),
            record("REQ-X-002").blocking(id("REQ-X-001")),
        ])
        .unwrap();
        assert!(check(&set).is_empty());
    }

    #[test]
    fn missing_block_is_flagged_and_fixed() {
        let original = RequirementSet::from_records([
            record("REQ-X-001")
                .with_text("A")
                .depends_on(id("REQ-X-002")),
            record("REQ-X-002").with_text("B"),
        ])
        .unwrap();

        let violations = check(&original);
        assert_eq!(
            violations,
            vec![ReciprocityViolation {
                dependent: id("REQ-X-001"),
                prerequisite: id("REQ-X-002"),
                fix: FixAction::AddBlock {
                    on: id("REQ-X-002"),
                    blocked: id("REQ-X-001"),
                },
            }]
        );

        let mut fixed = original.clone();
        assert_eq!(apply_fixes(&mut fixed, &violations), 1);
        assert!(check(&fixed).is_empty());

        let b = fixed.get(&id("REQ-X-002")).unwrap();
        assert_eq!(b.blocks, [id("REQ-X-001")].into());

        // everything except B.blocks is untouched
        let mut expected = original.get(&id("REQ-X-002")).unwrap().clone();
        expected.blocks.insert(id("REQ-X-001"));
        assert_eq!(b, &expected);
        assert_eq!(
            fixed.get(&id("REQ-X-001")),
            original.get(&id("REQ-X-001"))
        );
    }

    #[test]
    fn missing_dependency_is_flagged() {
        let set = RequirementSet::from_records([
            record("REQ-X-001"),
            record("REQ-X-002").blocking(id("REQ-X-001")),
        ])
        .unwrap();

        let violations = check(&set);
        assert_eq!(violations.len(), 1);
        assert_eq!(
            violations[0].fix,
            FixAction::AddDependency {
                on: id("REQ-X-001"),
                requires: id("REQ-X-002"),
            }
        );
    }

    #[test]
    fn fixes_are_monotonic() {
        let mut set = RequirementSet::from_records([
            record("REQ-X-001")
                .depends_on(id("REQ-X-002"))
                .depends_on(id("REQ-X-003")),
            record("REQ-X-002").blocking(id("REQ-X-003")),
            record("REQ-X-003"),
            record("REQ-X-004").blocking(id("REQ-X-001")),
        ])
        .unwrap();

        let before = edge_count(&set);
        let violations = check(&set);
        assert_eq!(violations.len(), 4);

        let applied = apply_fixes(&mut set, &violations);
        assert_eq!(applied, 4);
        assert_eq!(edge_count(&set), before + applied);
        assert!(check(&set).is_empty());
    }

    #[test]
    fn unknown_and_tombstoned_targets_are_ignored() {
        let mut set = RequirementSet::from_records([
            record("REQ-X-001")
                .depends_on(id("REQ-X-404"))
                .depends_on(id("REQ-X-002")),
            record("REQ-X-002"),
        ])
        .unwrap();
        set.tombstone(&id("REQ-X-002"));
        assert!(check(&set).is_empty());
    }

    #[test]
    fn reapplying_fixes_is_a_no_op() {
        let mut set = RequirementSet::from_records([
            record("REQ-X-001").depends_on(id("REQ-X-002")),
            record("REQ-X-002"),
        ])
        .unwrap();
        let violations = check(&set);
        assert_eq!(apply_fixes(&mut set, &violations), 1);
        assert_eq!(apply_fixes(&mut set, &violations), 0);
    }
}
