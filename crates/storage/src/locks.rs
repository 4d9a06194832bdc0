//! Process-wide per-key write locks.
//!
//! Keys are qualified by column family so two families never contend.
//! Acquisition is reentrant per transaction. A lock held by another
//! transaction fails the acquirer immediately with `Conflict` in no-wait
//! mode, or with `LockTimeout` after the configured wait. Release
//! happens on commit, abort, and drop.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use themis_core::error::{Result, ThemisError};

/// Sleep slice while waiting on a contended lock.
const WAIT_SLICE: Duration = Duration::from_millis(1);

/// Lock table mapping qualified keys to holder transaction ids.
#[derive(Debug, Default)]
pub struct LockTable {
    holders: DashMap<Vec<u8>, u64>,
}

/// Qualified lock key: `cf \x00 key`.
pub fn qualify(cf: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cf.len() + 1 + key.len());
    out.extend_from_slice(cf.as_bytes());
    out.push(0);
    out.extend_from_slice(key);
    out
}

impl LockTable {
    /// Create an empty lock table.
    pub fn new() -> Self {
        LockTable::default()
    }

    /// Acquire the lock on `qualified` for `txn_id`.
    ///
    /// Returns `Ok(true)` when newly acquired, `Ok(false)` when the
    /// transaction already held it. `timeout_ms == 0` means no-wait:
    /// contention is an immediate `Conflict`. Otherwise the acquirer
    /// waits up to the timeout and then fails with `LockTimeout`.
    pub fn acquire(&self, qualified: &[u8], txn_id: u64, timeout_ms: u64) -> Result<bool> {
        let started = Instant::now();
        loop {
            match self.holders.entry(qualified.to_vec()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(txn_id);
                    return Ok(true);
                }
                dashmap::mapref::entry::Entry::Occupied(held) => {
                    if *held.get() == txn_id {
                        return Ok(false);
                    }
                }
            }
            if timeout_ms == 0 {
                return Err(ThemisError::conflict(describe(qualified)));
            }
            let waited = started.elapsed();
            if waited >= Duration::from_millis(timeout_ms) {
                return Err(ThemisError::lock_timeout(
                    describe(qualified),
                    waited.as_millis() as u64,
                ));
            }
            std::thread::sleep(WAIT_SLICE);
        }
    }

    /// Release one lock if `txn_id` holds it.
    pub fn release(&self, qualified: &[u8], txn_id: u64) {
        self.holders
            .remove_if(qualified, |_, holder| *holder == txn_id);
    }

    /// Release every lock in `keys` held by `txn_id`.
    pub fn release_all<'a>(&self, keys: impl IntoIterator<Item = &'a Vec<u8>>, txn_id: u64) {
        for key in keys {
            self.release(key, txn_id);
        }
    }

    /// Current holder of a lock, for diagnostics.
    pub fn holder(&self, qualified: &[u8]) -> Option<u64> {
        self.holders.get(qualified).map(|h| *h)
    }
}

fn describe(qualified: &[u8]) -> String {
    match qualified.iter().position(|&b| b == 0) {
        Some(split) => {
            let cf = String::from_utf8_lossy(&qualified[..split]);
            let key = String::from_utf8_lossy(&qualified[split + 1..]);
            format!("{}/{}", cf, key)
        }
        None => String::from_utf8_lossy(qualified).into_owned(),
    }
}
