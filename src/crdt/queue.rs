use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    crdt::{Field, FieldEntry},
    domain::RequirementId,
};

/// A single stamped field write.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Update {
    /// The record written to.
    pub record: RequirementId,
    /// The field written.
    pub field: Field,
    /// The stamped value.
    pub entry: FieldEntry,
}

/// Identifies a queued update until it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UpdateId(Uuid);

impl UpdateId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl BorshSerialize for UpdateId {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        BorshSerialize::serialize(&self.0.as_u128(), writer)
    }
}

impl BorshDeserialize for UpdateId {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        u128::deserialize_reader(reader).map(|value| Self(Uuid::from_u128(value)))
    }
}

/// An update waiting to be delivered to peers.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PendingUpdate {
    /// Handle used to acknowledge delivery.
    pub id: UpdateId,
    /// The write itself.
    pub update: Update,
    queued_at_ms: i64,
}

impl PendingUpdate {
    /// Wall-clock time at which the update was queued.
    ///
    /// Informational only; merges are ordered by logical time.
    #[must_use]
    pub fn queued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.queued_at_ms)
    }
}

/// Updates made while disconnected, in the order they were made.
///
/// Entries stay queued until acknowledged, so a crash between sending and
/// acknowledging redelivers rather than loses them. Redelivery is harmless
/// because applying an update twice is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OfflineQueue {
    pending: Vec<PendingUpdate>,
}

impl OfflineQueue {
    /// Appends an update and returns its handle.
    pub fn push(&mut self, update: Update) -> UpdateId {
        let id = UpdateId::new();
        self.pending.push(PendingUpdate {
            id,
            update,
            queued_at_ms: Utc::now().timestamp_millis(),
        });
        id
    }

    /// Every unacknowledged update, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<PendingUpdate> {
        self.pending.clone()
    }

    /// Removes an acknowledged update.
    ///
    /// Returns `false` if the id is not queued.
    pub fn ack(&mut self, id: UpdateId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|pending| pending.id != id);
        self.pending.len() != before
    }

    /// Number of unacknowledged updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether every update has been acknowledged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
