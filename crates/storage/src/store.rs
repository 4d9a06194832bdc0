//! The storage engine facade.
//!
//! `Store` owns the column families, the commit sequence, the lock
//! table, the snapshot registry, and the WAL. Durability is a full-state
//! snapshot file plus the WAL tail; reopening loads the snapshot,
//! replays intact WAL records, and repairs a torn tail. A lock file
//! (advisory, via fs2) guards against two processes opening the same
//! directory.

use crate::checkpoint::{self, Manifest};
use crate::iter::{prefix_upper_bound, RangeIter};
use crate::locks::LockTable;
use crate::memtable::Memtable;
use crate::options::StoreOptions;
use crate::snapshot::{Snapshot, SnapshotRegistry};
use crate::txn::{StoreTxn, TxnOptions};
use crate::wal::{self, Wal, WalOp, WalRecord};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use themis_core::error::{Result, ThemisError};
use themis_core::types::Direction;
use tracing::{debug, info, warn};

/// Name of the advisory lock file inside a data directory.
const LOCK_FILE: &str = "LOCK";

pub(crate) struct StoreInner {
    path: Option<PathBuf>,
    options: StoreOptions,
    cfs: RwLock<HashMap<String, Arc<Memtable>>>,
    committed_seq: AtomicU64,
    next_txn_id: AtomicU64,
    pub(crate) locks: LockTable,
    snapshots: Arc<SnapshotRegistry>,
    wal: Mutex<Option<Wal>>,
    /// Serializes sequence assignment, WAL append, and memtable apply.
    commit_mutex: Mutex<()>,
    /// Held for the lifetime of the store; fs2 releases on drop.
    _lock_file: Option<File>,
}

impl StoreInner {
    /// Column family accessor; families are created lazily by name.
    pub(crate) fn cf(&self, name: &str) -> Arc<Memtable> {
        if let Some(mem) = self.cfs.read().get(name) {
            return mem.clone();
        }
        let mut cfs = self.cfs.write();
        cfs.entry(name.to_string())
            .or_insert_with(|| Arc::new(Memtable::new()))
            .clone()
    }

    /// Point read at a sequence.
    pub(crate) fn read_at(&self, cf: &str, key: &[u8], seq: u64) -> Option<Vec<u8>> {
        self.cf(cf).get_at(key, seq)
    }

    /// Newest committed sequence of one key (0 = never written).
    pub(crate) fn latest_seq(&self, cf: &str, key: &[u8]) -> u64 {
        self.cf(cf).latest_seq(key)
    }

    /// Materialized ascending prefix scan at a sequence.
    pub(crate) fn scan_prefix_at(
        &self,
        cf: &str,
        prefix: &[u8],
        seq: u64,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let hi = prefix_upper_bound(prefix);
        self.cf(cf)
            .scan_batch(prefix, hi.as_deref(), None, seq, Direction::Forward, usize::MAX)
    }

    /// Configured lock-wait budget in milliseconds.
    pub(crate) fn lock_timeout_ms(&self) -> u64 {
        self.options.lock_timeout_ms
    }

    /// Commit protocol, called by `StoreTxn::commit` with the buffered
    /// writes. Holds the commit mutex across WAL append and apply so
    /// commits are atomic with respect to each other and to snapshots.
    pub(crate) fn commit_writes_inner(
        &self,
        writes: Vec<WalOp>,
        txn_id: u64,
        locked: &[Vec<u8>],
    ) -> Result<u64> {
        let _guard = self.commit_mutex.lock();
        let prev = self.committed_seq.load(Ordering::SeqCst);
        let seq = prev + 1;
        let record = WalRecord { seq, ops: writes };

        if self.options.durability.requires_wal() {
            let mut wal_slot = self.wal.lock();
            if let Some(wal) = wal_slot.as_mut() {
                if let Err(e) = wal.append(&record, self.options.durability.requires_sync()) {
                    // Nothing was applied; the caller releases locks on
                    // the abort path.
                    warn!(error = %e, "WAL append failed; aborting commit");
                    return Err(e);
                }
            }
        }

        let min_active = self.snapshots.min_active(prev);
        for op in &record.ops {
            self.cf(&op.cf)
                .apply(&op.key, seq, op.value.clone(), min_active);
        }
        self.committed_seq.store(seq, Ordering::SeqCst);
        self.locks.release_all(locked.iter(), txn_id);
        Ok(seq)
    }
}

/// The ordered key-value store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open (or create) a store at `path`.
    ///
    /// Fails with `StorageUnavailable` when another process holds the
    /// directory lock or the on-disk state is corrupt beyond the last
    /// durable barrier.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            ThemisError::storage(format!("data directory {} is locked", path.display()))
        })?;

        let inner = StoreInner {
            path: Some(path.clone()),
            options: options.clone(),
            cfs: RwLock::new(HashMap::new()),
            committed_seq: AtomicU64::new(0),
            next_txn_id: AtomicU64::new(1),
            locks: LockTable::new(),
            snapshots: Arc::new(SnapshotRegistry::new()),
            wal: Mutex::new(None),
            commit_mutex: Mutex::new(()),
            _lock_file: Some(lock_file),
        };
        let store = Store {
            inner: Arc::new(inner),
        };

        // Base state from the newest snapshot file, if present.
        let snapshot_seq = match checkpoint::load_snapshot_file(&path)? {
            Some((manifest, state)) => {
                for (cf, entries) in state {
                    let mem = store.cf(&cf);
                    for (key, value) in entries {
                        mem.apply(&key, manifest.snapshot_seq, Some(value), 0);
                    }
                }
                manifest.snapshot_seq
            }
            None => 0,
        };
        store
            .inner
            .committed_seq
            .store(snapshot_seq, Ordering::SeqCst);

        // Replay the WAL tail past the snapshot barrier.
        let wal_path = path.join(checkpoint::WAL_FILE);
        let records = wal::read_and_repair(&wal_path)?;
        let mut replayed = 0usize;
        for record in records {
            if record.seq <= snapshot_seq {
                continue;
            }
            store.apply_record(&record);
            store
                .inner
                .committed_seq
                .store(record.seq, Ordering::SeqCst);
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "replayed write-ahead log");
        }

        if options.durability.requires_wal() {
            let wal = Wal::open(&wal_path)?;
            let oversized = options.wal_compaction_threshold > 0
                && wal.len() > options.wal_compaction_threshold;
            *store.inner.wal.lock() = Some(wal);
            if oversized {
                store.compact()?;
            }
        }

        debug!(path = %path.display(), seq = store.committed_seq(), "store opened");
        Ok(store)
    }

    /// A store that lives entirely in memory (tests, ephemeral use).
    pub fn in_memory() -> Self {
        let inner = StoreInner {
            path: None,
            options: StoreOptions::in_memory(),
            cfs: RwLock::new(HashMap::new()),
            committed_seq: AtomicU64::new(0),
            next_txn_id: AtomicU64::new(1),
            locks: LockTable::new(),
            snapshots: Arc::new(SnapshotRegistry::new()),
            wal: Mutex::new(None),
            commit_mutex: Mutex::new(()),
            _lock_file: None,
        };
        Store {
            inner: Arc::new(inner),
        }
    }

    /// The open-time options.
    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Newest committed sequence.
    pub fn committed_seq(&self) -> u64 {
        self.inner.committed_seq.load(Ordering::SeqCst)
    }

    /// Pin a snapshot at the newest committed sequence.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::pin(self.committed_seq(), self.inner.snapshots.clone())
    }

    /// Begin a transaction with default options (waiting locks).
    pub fn begin(&self) -> StoreTxn {
        self.begin_with(TxnOptions::default())
    }

    /// Begin a transaction.
    pub fn begin_with(&self, options: TxnOptions) -> StoreTxn {
        let id = self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst);
        StoreTxn::new(self.inner.clone(), id, self.snapshot(), options)
    }

    /// Column family accessor; families are created lazily by name.
    pub(crate) fn cf(&self, name: &str) -> Arc<Memtable> {
        self.inner.cf(name)
    }

    /// Point read at a snapshot.
    pub fn get(&self, cf: &str, key: &[u8], snapshot: &Snapshot) -> Option<Vec<u8>> {
        self.cf(cf).get_at(key, snapshot.seq())
    }

    /// Lazy prefix iterator at a snapshot.
    pub fn prefix_iter(
        &self,
        cf: &str,
        prefix: &[u8],
        snapshot: &Snapshot,
        direction: Direction,
    ) -> RangeIter {
        RangeIter::new(
            self.cf(cf),
            snapshot.clone(),
            prefix.to_vec(),
            prefix_upper_bound(prefix),
            direction,
            None,
        )
    }

    /// Lazy range iterator over `[lo, hi)` at a snapshot, optionally
    /// starting strictly after (before, in reverse) `start_after`.
    pub fn range_iter(
        &self,
        cf: &str,
        lo: &[u8],
        hi: Option<&[u8]>,
        snapshot: &Snapshot,
        direction: Direction,
        start_after: Option<Vec<u8>>,
    ) -> RangeIter {
        RangeIter::new(
            self.cf(cf),
            snapshot.clone(),
            lo.to_vec(),
            hi.map(|h| h.to_vec()),
            direction,
            start_after,
        )
    }

    /// Apply a record's ops to the memtables (replay path; no WAL).
    fn apply_record(&self, record: &WalRecord) {
        for op in &record.ops {
            self.cf(&op.cf)
                .apply(&op.key, record.seq, op.value.clone(), 0);
        }
    }

    /// Rewrite the snapshot file at the current committed sequence and
    /// truncate the WAL. Runs under the commit mutex so the dumped state
    /// is a consistent commit boundary.
    pub fn compact(&self) -> Result<()> {
        let path = match &self.inner.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let _guard = self.inner.commit_mutex.lock();
        let seq = self.committed_seq();
        let state = self.dump_all(seq);
        checkpoint::write_snapshot_file(&path, seq, &state, self.inner.options.compression.hot)?;
        if let Some(wal) = self.inner.wal.lock().as_mut() {
            wal.reset()?;
        }
        info!(seq, "compacted store (snapshot rewritten, WAL truncated)");
        Ok(())
    }

    /// Write a self-contained checkpoint into `dir`. The directory can
    /// later be opened in place of the live directory, or archived.
    pub fn create_checkpoint(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let _guard = self.inner.commit_mutex.lock();
        let seq = self.committed_seq();
        let state = self.dump_all(seq);
        checkpoint::write_snapshot_file(dir, seq, &state, self.inner.options.compression.cold)?;
        info!(dir = %dir.display(), seq, "checkpoint created");
        Ok(())
    }

    /// Copy a checkpoint into a fresh data directory. The destination
    /// must not already contain a store.
    pub fn restore_from_checkpoint(
        checkpoint_dir: impl AsRef<Path>,
        dest: impl AsRef<Path>,
    ) -> Result<()> {
        checkpoint::restore_files(checkpoint_dir.as_ref(), dest.as_ref())
    }

    fn dump_all(&self, seq: u64) -> Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)> {
        let cfs = self.inner.cfs.read();
        let mut out: Vec<_> = cfs
            .iter()
            .map(|(name, mem)| (name.clone(), mem.dump_at(seq)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Flush state and release the directory lock. Also invoked from
    /// `Drop` of the last handle for persistent stores.
    pub fn close(&self) -> Result<()> {
        if self.inner.path.is_some() && self.inner.options.durability.requires_wal() {
            self.compact()?;
        }
        Ok(())
    }

    /// Manifest of the data directory, for diagnostics.
    pub fn manifest(&self) -> Result<Option<Manifest>> {
        match &self.inner.path {
            Some(path) => checkpoint::read_manifest(path),
            None => Ok(None),
        }
    }

    /// Number of active snapshots, for diagnostics.
    pub fn active_snapshots(&self) -> usize {
        self.inner.snapshots.active_count()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("committed_seq", &self.committed_seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_round_trip() {
        let store = Store::in_memory();
        let mut txn = store.begin();
        txn.put("entities", b"users:1", b"alice").unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert_eq!(
            store.get("entities", b"users:1", &snap),
            Some(b"alice".to_vec())
        );
        assert_eq!(store.get("entities", b"users:2", &snap), None);
    }

    #[test]
    fn test_snapshot_isolation_across_commit() {
        let store = Store::in_memory();
        let mut txn = store.begin();
        txn.put("entities", b"k", b"v1").unwrap();
        txn.commit().unwrap();

        let old = store.snapshot();
        let mut txn = store.begin();
        txn.put("entities", b"k", b"v2").unwrap();
        txn.commit().unwrap();

        assert_eq!(store.get("entities", b"k", &old), Some(b"v1".to_vec()));
        let new = store.snapshot();
        assert_eq!(store.get("entities", b"k", &new), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_commit_atomic_across_column_families() {
        let store = Store::in_memory();
        let mut txn = store.begin();
        txn.put("entities", b"users:1", b"alice").unwrap();
        txn.put("index", b"idx:name:alice:users:1", b"").unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert!(store.get("entities", b"users:1", &snap).is_some());
        assert!(store
            .get("index", b"idx:name:alice:users:1", &snap)
            .is_some());
    }

    #[test]
    fn test_abort_leaves_store_untouched() {
        let store = Store::in_memory();
        let mut txn = store.begin();
        txn.put("entities", b"users:1", b"alice").unwrap();
        txn.commit().unwrap();
        let seq_before = store.committed_seq();

        let mut txn = store.begin();
        txn.put("entities", b"users:1", b"mallory").unwrap();
        txn.delete("entities", b"users:1").unwrap();
        txn.abort();

        assert_eq!(store.committed_seq(), seq_before);
        let snap = store.snapshot();
        assert_eq!(
            store.get("entities", b"users:1", &snap),
            Some(b"alice".to_vec())
        );
    }

    #[test]
    fn test_drop_without_commit_aborts_and_releases_locks() {
        let store = Store::in_memory();
        {
            let mut txn = store.begin();
            txn.put("entities", b"k", b"v").unwrap();
            // Dropped here without commit.
        }
        let mut txn = store.begin();
        txn.put("entities", b"k", b"v2").unwrap();
        txn.commit().unwrap();
        let snap = store.snapshot();
        assert_eq!(store.get("entities", b"k", &snap), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_write_write_conflict() {
        let store = Store::in_memory();
        let mut t1 = store.begin();
        let mut t2 = store.begin();
        t1.put("entities", b"users:42", b"a").unwrap();
        let err = t2.put("entities", b"users:42", b"b").unwrap_err();
        assert!(err.is_retryable());
        t1.commit().unwrap();

        // After the winner commits, a fresh transaction still loses if
        // it started before the commit: its snapshot is stale.
        let err = t2.put("entities", b"users:42", b"b").unwrap_err();
        assert!(matches!(err, ThemisError::Conflict { .. }));
    }

    #[test]
    fn test_first_committer_wins_after_release() {
        let store = Store::in_memory();
        let mut t1 = store.begin();
        let mut t2 = store.begin();
        t1.put("entities", b"k", b"v1").unwrap();
        t1.commit().unwrap();

        // The lock is free now, but t2's snapshot predates t1's commit:
        // acquiring the write still fails so the first committer wins.
        let err = t2.put("entities", b"k", b"v2").unwrap_err();
        assert!(matches!(err, ThemisError::Conflict { .. }));
        t2.abort();

        let snap = store.snapshot();
        assert_eq!(store.get("entities", b"k", &snap), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
            let mut txn = store.begin();
            txn.put("entities", b"users:1", b"alice").unwrap();
            txn.put("entities", b"users:2", b"bob").unwrap();
            txn.commit().unwrap();
            let mut txn = store.begin();
            txn.delete("entities", b"users:2").unwrap();
            txn.commit().unwrap();
        }
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        let snap = store.snapshot();
        assert_eq!(
            store.get("entities", b"users:1", &snap),
            Some(b"alice".to_vec())
        );
        assert_eq!(store.get("entities", b"users:2", &snap), None);
        assert_eq!(store.committed_seq(), 2);
    }

    #[test]
    fn test_directory_lock_excludes_second_open() {
        let dir = TempDir::new().unwrap();
        let _store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        let second = Store::open(dir.path(), StoreOptions::default());
        assert!(matches!(
            second,
            Err(ThemisError::StorageUnavailable { .. })
        ));
    }

    #[test]
    fn test_compact_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
            for i in 0..10u8 {
                let mut txn = store.begin();
                txn.put("entities", format!("k{}", i).as_bytes(), &[i])
                    .unwrap();
                txn.commit().unwrap();
            }
            store.compact().unwrap();
            // More commits after compaction land in the fresh WAL.
            let mut txn = store.begin();
            txn.put("entities", b"k10", &[10]).unwrap();
            txn.commit().unwrap();
        }
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        let snap = store.snapshot();
        for i in 0..10u8 {
            assert_eq!(
                store.get("entities", format!("k{}", i).as_bytes(), &snap),
                Some(vec![i])
            );
        }
        assert_eq!(store.get("entities", b"k10", &snap), Some(vec![10]));
    }

    #[test]
    fn test_checkpoint_and_restore() {
        let data_dir = TempDir::new().unwrap();
        let ckpt_dir = TempDir::new().unwrap();
        let restored_dir = TempDir::new().unwrap();

        {
            let store = Store::open(data_dir.path(), StoreOptions::default()).unwrap();
            let mut txn = store.begin();
            txn.put("entities", b"users:1", b"alice").unwrap();
            txn.commit().unwrap();
            store.create_checkpoint(ckpt_dir.path().join("cp1")).unwrap();

            // Writes after the checkpoint are not part of it.
            let mut txn = store.begin();
            txn.put("entities", b"users:2", b"bob").unwrap();
            txn.commit().unwrap();
        }

        Store::restore_from_checkpoint(
            ckpt_dir.path().join("cp1"),
            restored_dir.path().join("data"),
        )
        .unwrap();
        let store = Store::open(
            restored_dir.path().join("data"),
            StoreOptions::default(),
        )
        .unwrap();
        let snap = store.snapshot();
        assert_eq!(
            store.get("entities", b"users:1", &snap),
            Some(b"alice".to_vec())
        );
        assert_eq!(store.get("entities", b"users:2", &snap), None);
    }
}
