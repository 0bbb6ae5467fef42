use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use tracing::{debug, instrument, warn};

use crate::{
    crdt::{
        EncodingError, Field, FieldEntry, FieldValue, LamportClock, MergePolicy, OfflineQueue,
        PendingUpdate, RecordState, ReplicaId, Timestamp, Update, UpdateId,
        encoding::{self, PayloadKind},
    },
    domain::{EngineConfig, RequirementId, RequirementRecord, RequirementSet},
};

/// Field state for every record, keyed by id.
///
/// This is the join-semilattice exchanged between replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StoreState {
    records: BTreeMap<RequirementId, RecordState>,
}

impl StoreState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The field map of one record.
    #[must_use]
    pub fn record(&self, id: &RequirementId) -> Option<&RecordState> {
        self.records.get(id)
    }

    /// Every record's field map, in id order.
    pub fn records(&self) -> impl Iterator<Item = (&RequirementId, &RecordState)> {
        self.records.iter()
    }

    /// Number of records with at least one field.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no field has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The newest timestamp anywhere in the state.
    #[must_use]
    pub fn latest(&self) -> Option<Timestamp> {
        self.records.values().filter_map(RecordState::latest).max()
    }

    /// Applies one update. Returns `true` if a field changed.
    pub fn apply(&mut self, update: &Update, policy: &MergePolicy) -> bool {
        self.records
            .entry(update.record.clone())
            .or_default()
            .apply(update.field.clone(), update.entry.clone(), policy)
    }

    /// Joins `other` into this state.
    pub fn join(&mut self, other: &Self, policy: &MergePolicy) {
        for (id, remote) in &other.records {
            self.records
                .entry(id.clone())
                .or_default()
                .join(remote, policy);
        }
    }
}

/// Joins two states.
///
/// Commutative, associative and idempotent for a fixed `policy`.
#[must_use]
pub fn merge(local: &StoreState, remote: &StoreState, policy: &MergePolicy) -> StoreState {
    let mut merged = local.clone();
    merged.join(remote, policy);
    merged
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
struct Persisted {
    replica: ReplicaId,
    clock: LamportClock,
    state: StoreState,
    queue: OfflineQueue,
}

/// One replica's view of the requirement fields.
///
/// Local writes are stamped by the replica's Lamport clock. Writes made
/// while offline are also queued for delivery to peers; the queue is part
/// of the encoded store, so it survives restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldStore {
    persisted: Persisted,
    policy: MergePolicy,
}

impl FieldStore {
    /// Creates an empty store for a replica.
    #[must_use]
    pub fn new(replica: ReplicaId, config: &EngineConfig) -> Self {
        Self {
            persisted: Persisted {
                replica,
                clock: LamportClock::default(),
                state: StoreState::default(),
                queue: OfflineQueue::default(),
            },
            policy: MergePolicy::from_config(config),
        }
    }

    /// This store's replica id.
    #[must_use]
    pub const fn replica(&self) -> ReplicaId {
        self.persisted.replica
    }

    /// The latest logical time issued or observed.
    #[must_use]
    pub const fn now(&self) -> Timestamp {
        self.persisted.clock.now()
    }

    /// The joined field state.
    #[must_use]
    pub const fn state(&self) -> &StoreState {
        &self.persisted.state
    }

    /// The merge policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Writes a stamped value.
    ///
    /// Always succeeds. The write only takes effect if it orders above the
    /// field's current entry, so a stale write is silently superseded.
    pub fn set_field(
        &mut self,
        record_id: RequirementId,
        field: Field,
        value: FieldValue,
        timestamp: Timestamp,
        origin: ReplicaId,
    ) {
        let update = Update {
            record: record_id,
            field,
            entry: FieldEntry::new(value, timestamp, origin),
        };
        self.apply(&update);
    }

    /// Writes a value stamped with the next local timestamp.
    ///
    /// Returns the update so the caller can forward or queue it.
    pub fn set_local(
        &mut self,
        record_id: RequirementId,
        field: Field,
        value: FieldValue,
    ) -> Update {
        let timestamp = self.persisted.clock.tick();
        let update = Update {
            record: record_id,
            field,
            entry: FieldEntry::new(value, timestamp, self.persisted.replica),
        };
        self.apply(&update);
        update
    }

    /// Marks a record as deleted.
    pub fn tombstone(&mut self, record_id: RequirementId) -> Update {
        self.set_local(record_id, Field::Deleted, FieldValue::Flag(true))
    }

    /// Loads every field of a record as local writes sharing one timestamp.
    #[instrument(level = "debug", skip(self, record), fields(id = %record.id))]
    pub fn import_record(&mut self, record: &RequirementRecord) -> Timestamp {
        let timestamp = self.persisted.clock.tick();
        let metadata = record.metadata.keys().cloned().map(Field::Metadata);
        for field in Field::CORE.into_iter().chain(metadata) {
            if let Some(value) = field.read(record) {
                let entry = FieldEntry::new(value, timestamp, self.persisted.replica);
                self.persisted
                    .state
                    .records
                    .entry(record.id.clone())
                    .or_default()
                    .apply(field, entry, &self.policy);
            }
        }
        timestamp
    }

    /// Loads every record of a set.
    pub fn import_set(&mut self, set: &RequirementSet) {
        for record in set {
            self.import_record(record);
        }
    }

    /// Rebuilds a record from its fields.
    ///
    /// Fields never written take defaults: the category from the id,
    /// `NOT_STARTED`, `MEDIUM` and empty text.
    #[must_use]
    pub fn materialize(&self, record_id: &RequirementId) -> Option<RequirementRecord> {
        let state = self.persisted.state.record(record_id)?;
        Some(materialize_record(record_id, state))
    }

    /// Overwrites the fields of `record` that this store holds, leaving the
    /// rest as they are.
    ///
    /// Returns `false`, leaving the record untouched, if the store has never
    /// seen the record.
    pub fn materialize_onto(&self, record: &mut RequirementRecord) -> bool {
        let Some(state) = self.persisted.state.record(&record.id) else {
            return false;
        };
        write_fields(state, record);
        true
    }

    /// Rebuilds every record.
    #[must_use]
    pub fn materialize_all(&self) -> RequirementSet {
        let mut set = RequirementSet::new();
        for (id, state) in self.persisted.state.records() {
            set.upsert(materialize_record(id, state));
        }
        set
    }

    /// Joins a remote replica's state into this one.
    #[instrument(level = "debug", skip_all, fields(replica = %self.persisted.replica))]
    pub fn merge(&mut self, remote: &StoreState) {
        if let Some(latest) = remote.latest() {
            self.persisted.clock.observe(latest);
        }
        self.persisted.state.join(remote, &self.policy);
    }

    /// Applies a write to the local state and queues it for delivery.
    pub fn enqueue(&mut self, update: Update) -> UpdateId {
        self.apply(&update);
        let id = self.persisted.queue.push(update);
        debug!(%id, pending = self.persisted.queue.len(), "queued update");
        id
    }

    /// Every unacknowledged update, in enqueue order.
    ///
    /// Updates stay queued until [`FieldStore::ack`] is called for them.
    #[must_use]
    pub fn drain(&self) -> Vec<PendingUpdate> {
        self.persisted.queue.drain()
    }

    /// Drops a delivered update from the queue.
    ///
    /// Returns `false` if the id is not queued.
    pub fn ack(&mut self, id: UpdateId) -> bool {
        self.persisted.queue.ack(id)
    }

    /// Number of unacknowledged updates.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.persisted.queue.len()
    }

    /// Applies updates received from a peer, in the order given.
    ///
    /// Returns the number of fields that changed.
    pub fn replay<'a>(&mut self, updates: impl IntoIterator<Item = &'a Update>) -> usize {
        let mut changed = 0;
        for update in updates {
            if self.apply(update) {
                changed += 1;
            }
        }
        changed
    }

    /// Encodes the whole store: replica id, clock, state and queue.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encoding::encode(PayloadKind::Store, &self.persisted)
    }

    /// Restores a store from [`FieldStore::encode`] output.
    ///
    /// The merge policy is not persisted; it comes from `config`.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodingError`] if the bytes are not a store encoded by
    /// a compatible version.
    pub fn decode(bytes: &[u8], config: &EngineConfig) -> Result<Self, EncodingError> {
        let persisted = encoding::decode(bytes, PayloadKind::Store)?;
        Ok(Self {
            persisted,
            policy: MergePolicy::from_config(config),
        })
    }

    fn apply(&mut self, update: &Update) -> bool {
        self.persisted.clock.observe(update.entry.timestamp);
        self.persisted.state.apply(update, &self.policy)
    }
}

fn materialize_record(id: &RequirementId, state: &RecordState) -> RequirementRecord {
    let mut record = RequirementRecord::new(id.clone());
    write_fields(state, &mut record);
    record
}

/// Writes every field the state holds; fields it lacks keep their value.
fn write_fields(state: &RecordState, record: &mut RequirementRecord) {
    for (field, entry) in state.iter() {
        if !field.write(record, entry.value.clone()) {
            warn!(
                id = %record.id,
                %field,
                value = %entry.value,
                "ignoring value of the wrong kind"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::domain::{Priority, Status, StatusOrder};

    fn id(s: &str) -> RequirementId {
        s.parse().unwrap()
    }

    fn store(replica: u128) -> FieldStore {
        FieldStore::new(ReplicaId::from_u128(replica), &EngineConfig::default())
    }

    #[test]
    fn later_status_wins_in_either_order() {
        let mut a = store(1);
        let mut b = store(2);
        a.set_field(
            id("REQ-X-001"),
            Field::Status,
            FieldValue::Status(Status::Complete),
            Timestamp(5),
            a.replica(),
        );
        b.set_field(
            id("REQ-X-001"),
            Field::Status,
            FieldValue::Status(Status::Partial),
            Timestamp(7),
            b.replica(),
        );

        let ab = merge(a.state(), b.state(), a.policy());
        let ba = merge(b.state(), a.state(), b.policy());
        assert_eq!(ab, ba);

        a.merge(b.state());
        let record = a.materialize(&id("REQ-X-001")).unwrap();
        assert_eq!(record.status, Status::Partial);
        assert_eq!(a.now(), Timestamp(7));
    }

    #[test]
    fn no_regression_policy_keeps_higher_status() {
        let config = EngineConfig::default().with_no_status_regression(true);
        let mut a = FieldStore::new(ReplicaId::from_u128(1), &config);
        let mut b = FieldStore::new(ReplicaId::from_u128(2), &config);
        a.set_field(
            id("REQ-X-001"),
            Field::Status,
            FieldValue::Status(Status::Complete),
            Timestamp(5),
            a.replica(),
        );
        b.set_field(
            id("REQ-X-001"),
            Field::Status,
            FieldValue::Status(Status::Partial),
            Timestamp(7),
            b.replica(),
        );

        let merged_a = merge(a.state(), b.state(), a.policy());
        b.merge(a.state());
        assert_eq!(&merged_a, b.state());
        assert_eq!(
            b.materialize(&id("REQ-X-001")).unwrap().status,
            Status::Complete
        );
    }

    #[test]
    fn stale_write_is_superseded() {
        let mut store = store(1);
        let first = store.set_local(id("REQ-X-001"), Field::Text, FieldValue::Text("new".into()));
        store.set_field(
            id("REQ-X-001"),
            Field::Text,
            FieldValue::Text("old".into()),
            Timestamp(first.entry.timestamp.0 - 1),
            ReplicaId::from_u128(9),
        );
        assert_eq!(store.materialize(&id("REQ-X-001")).unwrap().text, "new");
    }

    #[test]
    fn import_then_materialize_is_lossless() {
        let record = RequirementRecord::new(id("REQ-GIT-001"))
            .with_text("merge CSV files")
            .with_status(Status::Partial)
            .with_priority(Priority::High)
            .depends_on(id("REQ-GIT-002"))
            .with_metadata("effort_weeks", "2");
        let mut store = store(1);
        store.import_record(&record);
        assert_eq!(store.materialize(&record.id), Some(record));
    }

    #[test]
    fn materialize_fills_defaults() {
        let mut store = store(1);
        store.set_local(id("REQ-SYNC-004"), Field::Text, FieldValue::Text("sync".into()));
        let record = store.materialize(&id("REQ-SYNC-004")).unwrap();
        assert_eq!(record.category, "SYNC");
        assert_eq!(record.status, Status::NotStarted);
        assert_eq!(record.priority, Priority::Medium);
        assert!(record.is_live());
        assert_eq!(store.materialize(&id("REQ-SYNC-005")), None);
    }

    #[test]
    fn materialize_onto_keeps_fields_the_store_lacks() {
        let mut record = RequirementRecord::new(id("REQ-X-001"))
            .with_text("keep me")
            .with_status(Status::Complete)
            .with_metadata("owner", "sam");
        let mut store = store(1);
        store.set_field(
            id("REQ-X-001"),
            Field::Priority,
            FieldValue::Priority(Priority::High),
            Timestamp(3),
            ReplicaId::from_u128(2),
        );

        assert!(store.materialize_onto(&mut record));
        assert_eq!(record.text, "keep me");
        assert_eq!(record.status, Status::Complete);
        assert_eq!(record.priority, Priority::High);
        assert_eq!(record.metadata.get("owner").map(String::as_str), Some("sam"));

        let mut unknown = RequirementRecord::new(id("REQ-X-002")).with_text("untouched");
        assert!(!store.materialize_onto(&mut unknown));
        assert_eq!(unknown.text, "untouched");
    }

    #[test]
    fn tombstone_survives_merge() {
        let mut a = store(1);
        a.import_record(&RequirementRecord::new(id("REQ-X-001")));
        let mut b = a.clone();
        b.tombstone(id("REQ-X-001"));

        a.merge(b.state());
        let record = a.materialize(&id("REQ-X-001")).unwrap();
        assert!(!record.is_live());
        assert_eq!(a.materialize_all().live().count(), 0);
    }

    #[test]
    fn offline_updates_replay_in_order() {
        let mut offline = store(1);
        let first =
            offline.set_local(id("REQ-X-001"), Field::Text, FieldValue::Text("draft".into()));
        let first = offline.enqueue(first);
        let second =
            offline.set_local(id("REQ-X-001"), Field::Text, FieldValue::Text("final".into()));
        offline.enqueue(second);

        let pending = offline.drain();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);

        let mut peer = store(2);
        let changed = peer.replay(pending.iter().map(|p| &p.update));
        assert_eq!(changed, 2);
        assert_eq!(peer.materialize(&id("REQ-X-001")).unwrap().text, "final");

        // replaying again changes nothing
        assert_eq!(peer.replay(pending.iter().map(|p| &p.update)), 0);

        assert!(offline.ack(first));
        assert_eq!(offline.pending(), 1);
    }

    #[test]
    fn queue_survives_restart() {
        let mut original = store(1);
        let update = original.set_local(id("REQ-X-001"), Field::Text, FieldValue::Text("t".into()));
        original.enqueue(update);

        let restored = FieldStore::decode(&original.encode(), &EngineConfig::default()).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.drain(), original.drain());
        assert_eq!(restored.now(), original.now());
    }

    #[test]
    fn re_encoding_a_decoded_store_is_byte_identical() {
        let mut original = store(3);
        original.import_record(
            &RequirementRecord::new(id("REQ-X-001"))
                .with_text("one")
                .blocking(id("REQ-X-002"))
                .with_metadata("owner", "sam"),
        );
        original
            .import_record(&RequirementRecord::new(id("REQ-X-002")).depends_on(id("REQ-X-001")));
        let update = original.tombstone(id("REQ-X-002"));
        original.enqueue(update);

        let bytes = original.encode();
        let fresh = FieldStore::decode(&bytes, &EngineConfig::default()).unwrap();
        assert_eq!(fresh.encode(), bytes);
    }

    #[test]
    fn decoding_rejects_bare_state() {
        let bytes = encoding::encode_state(&StoreState::new());
        assert!(matches!(
            FieldStore::decode(&bytes, &EngineConfig::default()),
            Err(EncodingError::WrongPayload { .. })
        ));
    }

    fn policy_strategy() -> impl Strategy<Value = MergePolicy> {
        prop_oneof![
            Just(MergePolicy::last_writer_wins()),
            Just(MergePolicy::no_status_regression(StatusOrder::default())),
        ]
    }

    fn update_strategy() -> impl Strategy<Value = Update> {
        let field = prop_oneof![
            Just(Field::Status),
            Just(Field::Text),
            Just(Field::Metadata("owner".to_string())),
        ];
        (1u64..4, field, 0u64..6, 0u128..3, 0usize..4).prop_map(
            |(number, field, timestamp, origin, choice)| {
                let value = match field {
                    Field::Status => FieldValue::Status(Status::ALL[choice]),
                    _ => FieldValue::Text(format!("v{choice}")),
                };
                Update {
                    record: id(&format!("REQ-X-{number:03}")),
                    field,
                    entry: FieldEntry::new(
                        value,
                        Timestamp(timestamp),
                        ReplicaId::from_u128(origin),
                    ),
                }
            },
        )
    }

    fn state_strategy() -> impl Strategy<Value = StoreState> {
        proptest::collection::vec(update_strategy(), 0..16).prop_map(|updates| {
            let mut state = StoreState::new();
            for update in &updates {
                state.apply(update, &MergePolicy::last_writer_wins());
            }
            state
        })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(a in state_strategy(), policy in policy_strategy()) {
            prop_assert_eq!(merge(&a, &a, &policy), a);
        }

        #[test]
        fn merge_is_commutative(
            a in state_strategy(),
            b in state_strategy(),
            policy in policy_strategy(),
        ) {
            prop_assert_eq!(merge(&a, &b, &policy), merge(&b, &a, &policy));
        }

        #[test]
        fn merge_is_associative(
            a in state_strategy(),
            b in state_strategy(),
            c in state_strategy(),
            policy in policy_strategy(),
        ) {
            let left = merge(&merge(&a, &b, &policy), &c, &policy);
            let right = merge(&a, &merge(&b, &c, &policy), &policy);
            prop_assert_eq!(left, right);
        }

        #[test]
        fn encoding_round_trips(a in state_strategy()) {
            let decoded = encoding::decode_state(&encoding::encode_state(&a));
            prop_assert_eq!(decoded.ok(), Some(a));
        }

        #[test]
        fn replay_order_does_not_matter(
            updates in proptest::collection::vec(update_strategy(), 0..16),
        ) {
            let mut forward = store(1);
            forward.replay(&updates);
            let mut backward = store(2);
            backward.replay(updates.iter().rev());
            prop_assert_eq!(forward.state(), backward.state());
        }
    }
}
