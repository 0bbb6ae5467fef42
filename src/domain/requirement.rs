use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    num::NonZeroU32,
    str::FromStr,
};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::RequirementId;

/// Implementation status of a requirement.
///
/// The derived ordering is the default progression
/// `NotStarted < Missing < Partial < Complete`. Projects can override it with
/// a [`StatusOrder`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Work has not begun.
    NotStarted,
    /// The requirement is not met and no implementation exists.
    Missing,
    /// The requirement is partially met.
    Partial,
    /// The requirement is fully met.
    Complete,
}

impl Status {
    /// Every status, in the default order.
    pub const ALL: [Self; 4] = [Self::NotStarted, Self::Missing, Self::Partial, Self::Complete];

    /// The canonical tabular spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Missing => "MISSING",
            Self::Partial => "PARTIAL",
            Self::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    /// Case-insensitive; spaces and `-` are accepted in place of `_`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ParseEnumError::new("status", s))
    }
}

/// Priority of a requirement.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Must ship before anything else.
    P0,
    /// High priority.
    High,
    /// Medium priority.
    Medium,
    /// Low priority.
    Low,
}

impl Priority {
    /// Every priority, most urgent first.
    pub const ALL: [Self; 4] = [Self::P0, Self::High, Self::Medium, Self::Low];

    /// The canonical tabular spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|priority| priority.as_str() == normalized)
            .ok_or_else(|| ParseEnumError::new("priority", s))
    }
}

/// Error returned when a status or priority cell cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A project-defined total order over [`Status`].
///
/// Later entries rank higher. Used for regression detection, the
/// no-regression merge policy and the git merge tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Status>", into = "Vec<Status>")]
pub struct StatusOrder([Status; 4]);

impl StatusOrder {
    /// The rank of a status; higher is further along.
    #[must_use]
    pub fn rank(&self, status: Status) -> usize {
        self.0
            .iter()
            .position(|s| *s == status)
            .unwrap_or_default()
    }

    /// Returns the higher-ranked of two statuses.
    #[must_use]
    pub fn max(&self, a: Status, b: Status) -> Status {
        if self.rank(b) > self.rank(a) { b } else { a }
    }

    /// Whether moving from `from` to `to` goes backward.
    #[must_use]
    pub fn is_regression(&self, from: Status, to: Status) -> bool {
        self.rank(to) < self.rank(from)
    }

    /// The statuses from lowest to highest rank.
    #[must_use]
    pub const fn as_slice(&self) -> &[Status] {
        &self.0
    }
}

impl Default for StatusOrder {
    fn default() -> Self {
        Self(Status::ALL)
    }
}

impl TryFrom<Vec<Status>> for StatusOrder {
    type Error = String;

    fn try_from(order: Vec<Status>) -> Result<Self, Self::Error> {
        let distinct: BTreeSet<_> = order.iter().copied().collect();
        if order.len() != Status::ALL.len() || distinct.len() != Status::ALL.len() {
            return Err(format!(
                "status order must list each of {} exactly once",
                Status::ALL.map(Status::as_str).join(", ")
            ));
        }
        let mut statuses = Status::ALL;
        statuses.copy_from_slice(&order);
        Ok(Self(statuses))
    }
}

impl From<StatusOrder> for Vec<Status> {
    fn from(order: StatusOrder) -> Self {
        order.0.to_vec()
    }
}

/// A single row of the traceability matrix.
///
/// `dependencies` lists the requirements this one needs; `blocks` lists the
/// requirements that need this one. The two relations should mirror each
/// other (see [`crate::domain::reciprocity`]).
///
/// Columns the engine does not interpret (effort, assignee, dates, anything
/// project specific) live in `metadata`, keyed by their header name.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize)]
pub struct RequirementRecord {
    /// Primary key.
    pub id: RequirementId,
    /// Top-level grouping.
    pub category: String,
    /// Secondary grouping.
    pub subcategory: String,
    /// The requirement statement.
    pub text: String,
    /// Implementation status.
    pub status: Status,
    /// Priority.
    pub priority: Priority,
    /// Delivery phase, if scheduled.
    pub phase: Option<NonZeroU32>,
    /// Ids this record requires.
    pub dependencies: BTreeSet<RequirementId>,
    /// Ids that require this record.
    pub blocks: BTreeSet<RequirementId>,
    /// Opaque columns, keyed by header name.
    pub metadata: BTreeMap<String, String>,
    /// Tombstone flag. Deleted records stay in the store until the caller
    /// purges them.
    pub deleted: bool,
}

impl RequirementRecord {
    /// Creates a record with empty text, no relations and default status
    /// and priority.
    ///
    /// The category is taken from the id.
    #[must_use]
    pub fn new(id: RequirementId) -> Self {
        let category = id.category().to_string();
        Self {
            id,
            category,
            subcategory: String::new(),
            text: String::new(),
            status: Status::NotStarted,
            priority: Priority::Medium,
            phase: None,
            dependencies: BTreeSet::new(),
            blocks: BTreeSet::new(),
            metadata: BTreeMap::new(),
            deleted: false,
        }
    }

    /// Builder-style setter for the requirement text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder-style setter for the status.
    #[must_use]
    pub const fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Builder-style setter for the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder-style helper adding a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: RequirementId) -> Self {
        self.dependencies.insert(id);
        self
    }

    /// Builder-style helper adding a `blocks` entry.
    #[must_use]
    pub fn blocking(mut self, id: RequirementId) -> Self {
        self.blocks.insert(id);
        self
    }

    /// Builder-style helper setting a metadata column.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the record is live (not tombstoned).
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.deleted
    }

    /// The effort recorded in the given metadata column.
    ///
    /// Returns `None` when the column is absent, empty, unparsable, or not a
    /// positive finite number.
    #[must_use]
    pub fn effort(&self, column: &str) -> Option<f64> {
        self.metadata
            .get(column)
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|effort| effort.is_finite() && *effort > 0.0)
    }

    /// Whether the record lists itself as a dependency or in `blocks`.
    #[must_use]
    pub fn references_itself(&self) -> bool {
        self.dependencies.contains(&self.id) || self.blocks.contains(&self.id)
    }

    /// Content fingerprint.
    ///
    /// A SHA256 hash of the Borsh-serialized record. Any change to any
    /// field changes the fingerprint.
    ///
    /// # Panics
    ///
    /// Panics if borsh serialization fails (which should never happen for
    /// this data structure).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let encoded = borsh::to_vec(self).expect("this should never fail");
        let hash = Sha256::digest(encoded);
        format!("{hash:x}")
    }
}
