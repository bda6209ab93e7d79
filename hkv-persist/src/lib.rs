//! On-disk append log and snapshot persistence for a single node's stores.

pub mod engine;
pub mod record;
pub mod snapshot;

pub use engine::{PersistenceEngine, PersistenceStats, RecoveredState};
pub use record::{decode_record, encode_record, DecodeOutcome, LogEntry, Op};
pub use snapshot::{decode_snapshot, encode_snapshot, Snapshot, SnapshotEntry};
