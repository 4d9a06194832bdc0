//! Storage transactions.
//!
//! A transaction is a snapshot, a buffered write batch, and a set of
//! held locks. `put`/`delete` acquire the per-key lock up front and then
//! check the key's newest committed sequence against the snapshot, so a
//! write that would clobber a commit the transaction never saw fails
//! with `Conflict` at acquire time, not at commit. Reads are
//! read-your-writes over the snapshot.
//!
//! Locks are released on commit, abort, and drop. Dropping an active
//! transaction aborts it.

use crate::locks::qualify;
use crate::snapshot::Snapshot;
use crate::store::StoreInner;
use crate::wal::WalOp;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use themis_core::error::{Result, ThemisError};
use themis_core::types::Direction;

/// Per-transaction options.
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Fail lock acquisition immediately with `Conflict` instead of
    /// waiting up to the store's lock timeout.
    pub no_wait: bool,
}

#[derive(Debug, PartialEq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A read-write transaction over the store.
pub struct StoreTxn {
    store: Arc<StoreInner>,
    id: u64,
    snapshot: Snapshot,
    options: TxnOptions,
    /// Buffered writes per column family; `None` values are deletes.
    writes: HashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    /// Qualified keys this transaction holds locks on.
    locked: Vec<Vec<u8>>,
    state: TxnState,
}

impl StoreTxn {
    pub(crate) fn new(
        store: Arc<StoreInner>,
        id: u64,
        snapshot: Snapshot,
        options: TxnOptions,
    ) -> Self {
        StoreTxn {
            store,
            id,
            snapshot,
            options,
            writes: HashMap::new(),
            locked: Vec::new(),
            state: TxnState::Active,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The snapshot this transaction reads at.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// True while the transaction can still read and write.
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ThemisError::internal(format!(
                "transaction {} is no longer active",
                self.id
            )))
        }
    }

    /// Read-your-writes point read.
    pub fn get(&self, cf: &str, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(buffered) = self.writes.get(cf).and_then(|m| m.get(key)) {
            return buffered.clone();
        }
        self.store.read_at(cf, key, self.snapshot.seq())
    }

    /// Acquire the write lock for `cf`/`key` and run the conflict check.
    fn lock_for_write(&mut self, cf: &str, key: &[u8]) -> Result<()> {
        let qualified = qualify(cf, key);
        let timeout = if self.options.no_wait {
            0
        } else {
            self.store.lock_timeout_ms()
        };
        let newly = self.store.locks.acquire(&qualified, self.id, timeout)?;

        // First-committer-wins: a commit newer than our snapshot means
        // we would overwrite state we never observed.
        let latest = self.store.latest_seq(cf, key);
        if latest > self.snapshot.seq() {
            if newly {
                self.store.locks.release(&qualified, self.id);
            }
            return Err(ThemisError::conflict(format!(
                "{}/{}",
                cf,
                String::from_utf8_lossy(key)
            )));
        }
        if newly {
            self.locked.push(qualified);
        }
        Ok(())
    }

    /// Buffer a write, taking the key's write lock.
    pub fn put(&mut self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.lock_for_write(cf, key)?;
        self.writes
            .entry(cf.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    /// Buffer a delete, taking the key's write lock.
    pub fn delete(&mut self, cf: &str, key: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.lock_for_write(cf, key)?;
        self.writes
            .entry(cf.to_string())
            .or_default()
            .insert(key.to_vec(), None);
        Ok(())
    }

    /// Prefix scan that merges the snapshot with this transaction's own
    /// buffered writes. Used for uniqueness checks and index maintenance
    /// that must observe uncommitted state.
    pub fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = self
            .store
            .scan_prefix_at(cf, prefix, self.snapshot.seq())
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        if let Some(own) = self.writes.get(cf) {
            for (k, v) in own.range(prefix.to_vec()..) {
                if !k.starts_with(prefix) {
                    break;
                }
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }

    /// Prefix scan over the snapshot only, in the given direction.
    pub fn scan_prefix_snapshot(
        &self,
        cf: &str,
        prefix: &[u8],
        direction: Direction,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rows = self.store.scan_prefix_at(cf, prefix, self.snapshot.seq());
        if direction == Direction::Reverse {
            rows.reverse();
        }
        rows
    }

    /// Commit the batch atomically across every touched column family.
    pub fn commit(mut self) -> Result<u64> {
        self.ensure_active()?;
        let mut ops = Vec::new();
        for (cf, entries) in std::mem::take(&mut self.writes) {
            for (key, value) in entries {
                ops.push(WalOp {
                    cf: cf.clone(),
                    key,
                    value,
                });
            }
        }
        let locked = std::mem::take(&mut self.locked);
        match self.store.commit_writes_inner(ops, self.id, &locked) {
            Ok(seq) => {
                self.state = TxnState::Committed;
                Ok(seq)
            }
            Err(e) => {
                // Commit failed before apply; locks are still ours.
                self.store.locks.release_all(locked.iter(), self.id);
                self.state = TxnState::Aborted;
                Err(e)
            }
        }
    }

    /// Discard the batch and release every lock.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if self.state == TxnState::Active {
            self.writes.clear();
            let locked = std::mem::take(&mut self.locked);
            self.store.locks.release_all(locked.iter(), self.id);
            self.state = TxnState::Aborted;
        }
    }
}

impl Drop for StoreTxn {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Store;

    #[test]
    fn test_read_your_writes() {
        let store = Store::in_memory();
        let mut txn = store.begin();
        txn.put("entities", b"k", b"v").unwrap();
        assert_eq!(txn.get("entities", b"k"), Some(b"v".to_vec()));
        txn.delete("entities", b"k").unwrap();
        assert_eq!(txn.get("entities", b"k"), None);
    }

    #[test]
    fn test_reads_see_snapshot_not_later_commits() {
        let store = Store::in_memory();
        let mut setup = store.begin();
        setup.put("entities", b"k", b"old").unwrap();
        setup.commit().unwrap();

        let reader = store.begin();
        let mut writer = store.begin();
        writer.put("entities", b"other", b"x").unwrap();
        writer.commit().unwrap();

        // The reader's snapshot predates the second commit.
        assert_eq!(reader.get("entities", b"other"), None);
        assert_eq!(reader.get("entities", b"k"), Some(b"old".to_vec()));
    }

    #[test]
    fn test_scan_prefix_merges_buffered_writes() {
        let store = Store::in_memory();
        let mut setup = store.begin();
        setup.put("index", b"idx:a:1", b"").unwrap();
        setup.put("index", b"idx:a:2", b"").unwrap();
        setup.put("index", b"other:z", b"").unwrap();
        setup.commit().unwrap();

        let mut txn = store.begin();
        txn.put("index", b"idx:a:3", b"").unwrap();
        txn.delete("index", b"idx:a:1").unwrap();

        let keys: Vec<_> = txn
            .scan_prefix("index", b"idx:a:")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"idx:a:2".to_vec(), b"idx:a:3".to_vec()]);
    }

    #[test]
    fn test_operations_on_finished_txn_fail() {
        let store = Store::in_memory();
        let mut txn = store.begin();
        txn.put("entities", b"k", b"v").unwrap();
        let id = txn.id();
        txn.commit().unwrap();
        assert!(id > 0);
    }
}
