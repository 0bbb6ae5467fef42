use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    num::NonZeroU32,
};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::Serialize;

use crate::{
    crdt::{ReplicaId, Timestamp},
    domain::{EngineConfig, Priority, RequirementId, RequirementRecord, Status, StatusOrder},
};

/// A field of a requirement record.
///
/// Metadata columns are fields in their own right, keyed by column name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub enum Field {
    /// Top-level grouping.
    Category,
    /// Secondary grouping.
    Subcategory,
    /// Requirement statement.
    Text,
    /// Implementation status.
    Status,
    /// Priority.
    Priority,
    /// Delivery phase.
    Phase,
    /// Ids the record requires.
    Dependencies,
    /// Ids that require the record.
    Blocks,
    /// Tombstone flag.
    Deleted,
    /// An opaque metadata column.
    Metadata(String),
}

impl Field {
    /// Every field with a dedicated column.
    pub const CORE: [Self; 9] = [
        Self::Category,
        Self::Subcategory,
        Self::Text,
        Self::Status,
        Self::Priority,
        Self::Phase,
        Self::Dependencies,
        Self::Blocks,
        Self::Deleted,
    ];

    /// The column name of this field.
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Category => "category",
            Self::Subcategory => "subcategory",
            Self::Text => "text",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::Phase => "phase",
            Self::Dependencies => "dependencies",
            Self::Blocks => "blocks",
            Self::Deleted => "deleted",
            Self::Metadata(name) => name.as_str(),
        }
    }

    /// The field stored under a column name. Unknown columns are metadata.
    #[must_use]
    pub fn from_column(name: &str) -> Self {
        Self::CORE
            .into_iter()
            .find(|field| field.column() == name)
            .unwrap_or_else(|| Self::Metadata(name.to_string()))
    }

    /// Reads this field from a record.
    ///
    /// Returns `None` for a metadata column the record does not have.
    #[must_use]
    pub fn read(&self, record: &RequirementRecord) -> Option<FieldValue> {
        let value = match self {
            Self::Category => FieldValue::Text(record.category.clone()),
            Self::Subcategory => FieldValue::Text(record.subcategory.clone()),
            Self::Text => FieldValue::Text(record.text.clone()),
            Self::Status => FieldValue::Status(record.status),
            Self::Priority => FieldValue::Priority(record.priority),
            Self::Phase => FieldValue::Phase(record.phase),
            Self::Dependencies => FieldValue::Ids(record.dependencies.clone()),
            Self::Blocks => FieldValue::Ids(record.blocks.clone()),
            Self::Deleted => FieldValue::Flag(record.deleted),
            Self::Metadata(name) => FieldValue::Text(record.metadata.get(name)?.clone()),
        };
        Some(value)
    }

    /// Writes a value into this field of a record.
    ///
    /// Returns `false`, leaving the record untouched, if the value has the
    /// wrong kind for the field.
    pub fn write(&self, record: &mut RequirementRecord, value: FieldValue) -> bool {
        match (self, value) {
            (Self::Category, FieldValue::Text(text)) => record.category = text,
            (Self::Subcategory, FieldValue::Text(text)) => record.subcategory = text,
            (Self::Text, FieldValue::Text(text)) => record.text = text,
            (Self::Status, FieldValue::Status(status)) => record.status = status,
            (Self::Priority, FieldValue::Priority(priority)) => record.priority = priority,
            (Self::Phase, FieldValue::Phase(phase)) => record.phase = phase,
            (Self::Dependencies, FieldValue::Ids(ids)) => record.dependencies = ids,
            (Self::Blocks, FieldValue::Ids(ids)) => record.blocks = ids,
            (Self::Deleted, FieldValue::Flag(deleted)) => record.deleted = deleted,
            (Self::Metadata(name), FieldValue::Text(text)) => {
                record.metadata.insert(name.clone(), text);
            }
            _ => return false,
        }
        true
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl Serialize for Field {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.column())
    }
}

/// The value of a single field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub enum FieldValue {
    /// Free text.
    Text(String),
    /// A status.
    Status(Status),
    /// A priority.
    Priority(Priority),
    /// An optional phase number.
    Phase(Option<NonZeroU32>),
    /// A set of requirement ids.
    Ids(BTreeSet<RequirementId>),
    /// A boolean flag.
    Flag(bool),
}

impl FieldValue {
    /// Renders the value as a table cell, joining ids with `id_delimiter`.
    #[must_use]
    pub fn to_cell(&self, id_delimiter: char) -> String {
        match self {
            Self::Ids(ids) => {
                let ids: Vec<_> = ids.iter().map(RequirementId::as_str).collect();
                ids.join(&id_delimiter.to_string())
            }
            other => other.to_string(),
        }
    }
}

/// Human-readable form. Id sets are comma separated; use
/// [`FieldValue::to_cell`] for table output.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Status(status) => fmt::Display::fmt(status, f),
            Self::Priority(priority) => fmt::Display::fmt(priority, f),
            Self::Phase(Some(phase)) => fmt::Display::fmt(phase, f),
            Self::Phase(None) => Ok(()),
            Self::Ids(ids) => {
                let ids: Vec<_> = ids.iter().map(RequirementId::as_str).collect();
                f.write_str(&ids.join(", "))
            }
            Self::Flag(flag) => fmt::Display::fmt(flag, f),
        }
    }
}

/// A field value stamped with the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FieldEntry {
    /// The value written.
    pub value: FieldValue,
    /// Logical time of the write.
    pub timestamp: Timestamp,
    /// The replica that made the write.
    pub origin: ReplicaId,
}

impl FieldEntry {
    /// Creates an entry.
    #[must_use]
    pub const fn new(value: FieldValue, timestamp: Timestamp, origin: ReplicaId) -> Self {
        Self {
            value,
            timestamp,
            origin,
        }
    }
}

/// How competing entries for the same field are ordered.
///
/// Last-writer-wins orders entries by `(timestamp, origin, value)`. With
/// the no-regression policy the status field is ordered by rank first. Both
/// are total orders, so the join (keep the greater entry) is commutative,
/// associative and idempotent provided every replica uses the same policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePolicy {
    status_order: Option<StatusOrder>,
}

impl MergePolicy {
    /// Plain last-writer-wins for every field.
    #[must_use]
    pub const fn last_writer_wins() -> Self {
        Self { status_order: None }
    }

    /// Never lets a merge move the status backward in `order`.
    #[must_use]
    pub const fn no_status_regression(order: StatusOrder) -> Self {
        Self {
            status_order: Some(order),
        }
    }

    /// The policy selected by the configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        if config.no_status_regression {
            Self::no_status_regression(config.status_order.clone())
        } else {
            Self::last_writer_wins()
        }
    }

    /// Whether the status field is merged by rank.
    #[must_use]
    pub const fn prevents_status_regression(&self) -> bool {
        self.status_order.is_some()
    }

    /// Compares two entries for the same field.
    #[must_use]
    pub fn compare(&self, field: &Field, a: &FieldEntry, b: &FieldEntry) -> Ordering {
        let rank = |entry: &FieldEntry| match (field, &entry.value, &self.status_order) {
            (Field::Status, FieldValue::Status(status), Some(order)) => Some(order.rank(*status)),
            _ => None,
        };

        rank(a)
            .cmp(&rank(b))
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.origin.cmp(&b.origin))
            .then_with(|| a.value.cmp(&b.value))
    }
}

/// The field map of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RecordState {
    fields: BTreeMap<Field, FieldEntry>,
}

impl RecordState {
    /// The current entry for a field.
    #[must_use]
    pub fn get(&self, field: &Field) -> Option<&FieldEntry> {
        self.fields.get(field)
    }

    /// Every field entry, in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&Field, &FieldEntry)> {
        self.fields.iter()
    }

    /// The newest timestamp of any field.
    #[must_use]
    pub fn latest(&self) -> Option<Timestamp> {
        self.fields.values().map(|entry| entry.timestamp).max()
    }

    /// Offers an entry for a field; it is kept if it orders above the
    /// current one.
    ///
    /// Returns `true` if the field changed.
    pub fn apply(&mut self, field: Field, entry: FieldEntry, policy: &MergePolicy) -> bool {
        match self.fields.get_mut(&field) {
            Some(current) => {
                if policy.compare(&field, &entry, current) == Ordering::Greater {
                    *current = entry;
                    true
                } else {
                    false
                }
            }
            None => {
                self.fields.insert(field, entry);
                true
            }
        }
    }

    /// Joins every field of `other` into this record.
    pub fn join(&mut self, other: &Self, policy: &MergePolicy) {
        for (field, entry) in &other.fields {
            self.apply(field.clone(), entry.clone(), policy);
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn entry(value: FieldValue, ts: u64, origin: u128) -> FieldEntry {
        FieldEntry::new(value, Timestamp(ts), ReplicaId::from_u128(origin))
    }

    #[test_case("status", &Field::Status)]
    #[test_case("dependencies", &Field::Dependencies)]
    #[test_case("effort_weeks", &Field::Metadata("effort_weeks".into()); "metadata")]
    fn columns_map_to_fields(column: &str, expected: &Field) {
        let field = Field::from_column(column);
        assert_eq!(&field, expected);
        assert_eq!(field.column(), column);
    }

    #[test_case('|', "REQ-X-001|REQ-X-002")]
    #[test_case(';', "REQ-X-001;REQ-X-002")]
    fn id_cells_use_the_configured_delimiter(delimiter: char, expected: &str) {
        let ids: BTreeSet<RequirementId> = ["REQ-X-002", "REQ-X-001"]
            .into_iter()
            .map(|id| id.parse().unwrap())
            .collect();
        let value = FieldValue::Ids(ids);
        assert_eq!(value.to_cell(delimiter), expected);
        assert_eq!(value.to_string(), "REQ-X-001, REQ-X-002");
    }

    #[test]
    fn newer_timestamp_wins() {
        let policy = MergePolicy::last_writer_wins();
        let mut state = RecordState::default();
        state.apply(
            Field::Status,
            entry(FieldValue::Status(Status::Complete), 5, 1),
            &policy,
        );
        assert!(state.apply(
            Field::Status,
            entry(FieldValue::Status(Status::Partial), 7, 1),
            &policy,
        ));
        assert!(!state.apply(
            Field::Status,
            entry(FieldValue::Status(Status::Missing), 6, 9),
            &policy,
        ));
        assert_eq!(
            state.get(&Field::Status).unwrap().value,
            FieldValue::Status(Status::Partial)
        );
    }

    #[test]
    fn origin_breaks_timestamp_ties() {
        let policy = MergePolicy::last_writer_wins();
        let low = entry(FieldValue::Text("low".into()), 3, 1);
        let high = entry(FieldValue::Text("high".into()), 3, 2);
        assert_eq!(policy.compare(&Field::Text, &low, &high), Ordering::Less);
    }

    #[test]
    fn no_regression_policy_ranks_status_first() {
        let policy = MergePolicy::no_status_regression(StatusOrder::default());
        let complete = entry(FieldValue::Status(Status::Complete), 5, 1);
        let partial = entry(FieldValue::Status(Status::Partial), 7, 2);
        assert_eq!(
            policy.compare(&Field::Status, &complete, &partial),
            Ordering::Greater
        );

        // other fields are still last-writer-wins
        let old = entry(FieldValue::Text("old".into()), 5, 1);
        let new = entry(FieldValue::Text("new".into()), 7, 2);
        assert_eq!(policy.compare(&Field::Text, &old, &new), Ordering::Less);
    }

    #[test]
    fn read_and_write_agree() {
        let source = RequirementRecord::new("REQ-X-001".parse().unwrap())
            .with_text("text")
            .with_status(Status::Partial)
            .depends_on("REQ-X-002".parse().unwrap())
            .with_metadata("owner", "sam");
        let mut target = RequirementRecord::new("REQ-X-001".parse().unwrap());

        let fields = Field::CORE
            .into_iter()
            .chain([Field::Metadata("owner".into())]);
        for field in fields {
            let value = field.read(&source).unwrap();
            assert!(field.write(&mut target, value));
        }
        assert_eq!(target, source);
    }

    #[test]
    fn mismatched_value_is_not_written() {
        let mut record = RequirementRecord::new("REQ-X-001".parse().unwrap());
        assert!(!Field::Status.write(&mut record, FieldValue::Text("DONE".into())));
        assert_eq!(record.status, Status::NotStarted);
    }
}
