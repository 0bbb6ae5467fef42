//! Per-field last-writer-wins replication of requirement records.
//!
//! Every field of every record carries the value, the logical time of the
//! write and the replica that made it. Replicas converge by joining their
//! states, in any order and any number of times.

mod clock;
pub use clock::{LamportClock, ReplicaId, Timestamp};

mod field;
pub use field::{Field, FieldEntry, FieldValue, MergePolicy, RecordState};

mod queue;
pub use queue::{OfflineQueue, PendingUpdate, Update, UpdateId};

mod store;
pub use store::{FieldStore, StoreState, merge};

pub mod encoding;
pub use encoding::{EncodingError, decode_state, encode_state};
