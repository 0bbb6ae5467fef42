use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A logical (Lamport) timestamp.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
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
pub struct Timestamp(pub u64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Identifies the replica that made a write.
///
/// Used to break timestamp ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// A fresh random replica id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// A replica id from a fixed value.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for ReplicaId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl BorshSerialize for ReplicaId {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        BorshSerialize::serialize(&self.0.as_u128(), writer)
    }
}

impl BorshDeserialize for ReplicaId {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        u128::deserialize_reader(reader).map(Self::from_u128)
    }
}

/// A Lamport clock.
///
/// `tick` for every local write, `observe` for every remote timestamp seen.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize,
)]
pub struct LamportClock {
    last: u64,
}

impl LamportClock {
    /// The most recent timestamp issued or observed.
    #[must_use]
    pub const fn now(self) -> Timestamp {
        Timestamp(self.last)
    }

    /// Issues the next timestamp.
    pub const fn tick(&mut self) -> Timestamp {
        self.last = self.last.saturating_add(1);
        Timestamp(self.last)
    }

    /// Advances past a timestamp seen elsewhere.
    pub fn observe(&mut self, timestamp: Timestamp) {
        self.last = self.last.max(timestamp.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_strictly_increasing() {
        let mut clock = LamportClock::default();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
    }

    #[test]
    fn observe_never_moves_backward() {
        let mut clock = LamportClock::default();
        clock.observe(Timestamp(10));
        assert_eq!(clock.now(), Timestamp(10));
        clock.observe(Timestamp(3));
        assert_eq!(clock.now(), Timestamp(10));
        assert_eq!(clock.tick(), Timestamp(11));
    }

    #[test]
    fn replica_ids_round_trip_through_borsh() {
        let replica = ReplicaId::from_u128(42);
        let bytes = borsh::to_vec(&replica).unwrap();
        assert_eq!(borsh::from_slice::<ReplicaId>(&bytes).unwrap(), replica);
    }
}
