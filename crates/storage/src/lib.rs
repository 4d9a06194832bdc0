//! # themis-storage
//!
//! The ordered key-value engine underneath every other Themis layer:
//! column families, MVCC snapshots, pessimistic per-key write locks,
//! prefix iteration, atomic write batches, a CRC-framed write-ahead log,
//! and point-in-time checkpoints.
//!
//! ## Shape
//!
//! The store keeps each column family as an ordered map of key to
//! version chain. A committed write appends `(commit_seq, value)` to the
//! chain; readers resolve the newest version at or below their snapshot
//! sequence. Durability is a full-state snapshot file plus a WAL tail:
//! reopen loads the snapshot, replays the WAL, and discards a torn
//! trailing record.
//!
//! ## Concurrency
//!
//! Writers take per-key locks from a process-wide lock table at
//! `put`/`delete` time; a held lock fails the acquirer with `Conflict`
//! (no-wait) or `LockTimeout` (after the configured wait). Commit is
//! serialized by a single commit mutex: WAL append, sequence bump, and
//! memtable apply happen atomically with respect to other commits.
//! Locks are released on every exit path; dropping an unfinished
//! transaction aborts it.

pub mod checkpoint;
pub mod memtable;
pub mod iter;
pub mod locks;
pub mod options;
pub mod snapshot;
pub mod store;
pub mod txn;
pub mod wal;

pub use iter::RangeIter;
pub use options::{CompressionLevel, DurabilityMode, StoreOptions};
pub use snapshot::Snapshot;
pub use store::Store;
pub use txn::StoreTxn;
