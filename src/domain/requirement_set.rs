//! An arena of requirement records indexed by id.
//!
//! Relations between records are stored as id sets on each record, never as
//! references, so mutually dependent records are ordinary data.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::{RequirementId, RequirementRecord, Status, StatusOrder};

/// The set of requirements in one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementSet {
    records: BTreeMap<RequirementId, RequirementRecord>,
}

/// A record with this id is already present.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("duplicate requirement id {0}")]
pub struct DuplicateId(pub RequirementId);

impl RequirementSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from records.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateId`] for the first id that appears twice.
    pub fn from_records(
        records: impl IntoIterator<Item = RequirementRecord>,
    ) -> Result<Self, DuplicateId> {
        let mut set = Self::new();
        for record in records {
            set.insert(record)?;
        }
        Ok(set)
    }

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateId`] if a record with the same id exists, including
    /// a tombstoned one.
    pub fn insert(&mut self, record: RequirementRecord) -> Result<(), DuplicateId> {
        if self.records.contains_key(&record.id) {
            return Err(DuplicateId(record.id));
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Inserts or replaces a record, returning the previous version.
    pub fn upsert(&mut self, record: RequirementRecord) -> Option<RequirementRecord> {
        self.records.insert(record.id.clone(), record)
    }

    /// Looks up a record, live or tombstoned.
    #[must_use]
    pub fn get(&self, id: &RequirementId) -> Option<&RequirementRecord> {
        self.records.get(id)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, id: &RequirementId) -> Option<&mut RequirementRecord> {
        self.records.get_mut(id)
    }

    /// Whether a record with this id exists, live or tombstoned.
    #[must_use]
    pub fn contains(&self, id: &RequirementId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in id order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = &RequirementRecord> {
        self.records.values()
    }

    /// Live records in id order.
    pub fn live(&self) -> impl Iterator<Item = &RequirementRecord> {
        self.records.values().filter(|record| record.is_live())
    }

    /// Marks a record as deleted.
    ///
    /// Returns `false` if the id is unknown or already tombstoned.
    pub fn tombstone(&mut self, id: &RequirementId) -> bool {
        match self.records.get_mut(id) {
            Some(record) if record.is_live() => {
                record.deleted = true;
                true
            }
            _ => false,
        }
    }

    /// Removes every tombstoned record and returns their ids.
    ///
    /// This is the caller's garbage collection hook; the engine itself never
    /// calls it.
    pub fn purge_tombstones(&mut self) -> Vec<RequirementId> {
        let purged: Vec<_> = self
            .records
            .values()
            .filter(|record| !record.is_live())
            .map(|record| record.id.clone())
            .collect();
        for id in &purged {
            self.records.remove(id);
        }
        purged
    }

    /// A digest over every record fingerprint, in id order.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for record in self.records.values() {
            hasher.update(record.fingerprint().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl IntoIterator for RequirementSet {
    type Item = RequirementRecord;
    type IntoIter = std::collections::btree_map::IntoValues<RequirementId, RequirementRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_values()
    }
}

impl<'a> IntoIterator for &'a RequirementSet {
    type Item = &'a RequirementRecord;
    type IntoIter = std::collections::btree_map::Values<'a, RequirementId, RequirementRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.values()
    }
}

/// A record whose status moved backward.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StatusRegression {
    /// The record.
    pub id: RequirementId,
    /// Status before the change.
    pub from: Status,
    /// Status after the change.
    pub to: Status,
}

/// Finds records present in both sets whose status moved backward in
/// `order`.
#[must_use]
pub fn detect_regressions(
    before: &RequirementSet,
    after: &RequirementSet,
    order: &StatusOrder,
) -> Vec<StatusRegression> {
    after
        .live()
        .filter_map(|record| {
            let previous = before.get(&record.id)?;
            order
                .is_regression(previous.status, record.status)
                .then(|| StatusRegression {
                    id: record.id.clone(),
                    from: previous.status,
                    to: record.status,
                })
        })
        .collect()
}
