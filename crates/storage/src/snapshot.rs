//! Snapshot handles and the active-snapshot registry.
//!
//! A snapshot is just a committed sequence number plus a registration in
//! the registry. The registry's minimum active sequence bounds version-
//! chain trimming: a version is only dropped once no live snapshot can
//! still observe it. Handles deregister on drop; clones share one
//! registration.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of live snapshot sequences with reference counts.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    active: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        SnapshotRegistry::default()
    }

    fn register(&self, seq: u64) {
        *self.active.lock().entry(seq).or_insert(0) += 1;
    }

    fn unregister(&self, seq: u64) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                active.remove(&seq);
            }
        }
    }

    /// Oldest sequence any live snapshot still reads, or `fallback` when
    /// none are active (trimming may then advance to the latest commit).
    pub fn min_active(&self, fallback: u64) -> u64 {
        self.active
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(fallback)
    }

    /// Number of distinct active sequences, for diagnostics.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// A read view pinned at one committed sequence.
#[derive(Debug)]
pub struct Snapshot {
    seq: u64,
    registry: Arc<SnapshotRegistry>,
}

impl Snapshot {
    /// Pin a snapshot at `seq` in `registry`.
    pub(crate) fn pin(seq: u64, registry: Arc<SnapshotRegistry>) -> Self {
        registry.register(seq);
        Snapshot { seq, registry }
    }

    /// The committed sequence this snapshot reads at.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        Snapshot::pin(self.seq, self.registry.clone())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.registry.unregister(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_active_tracks_oldest() {
        let registry = Arc::new(SnapshotRegistry::new());
        assert_eq!(registry.min_active(42), 42);

        let s1 = Snapshot::pin(5, registry.clone());
        let s2 = Snapshot::pin(9, registry.clone());
        assert_eq!(registry.min_active(42), 5);

        drop(s1);
        assert_eq!(registry.min_active(42), 9);
        drop(s2);
        assert_eq!(registry.min_active(42), 42);
    }

    #[test]
    fn test_clone_shares_and_refcounts() {
        let registry = Arc::new(SnapshotRegistry::new());
        let s1 = Snapshot::pin(3, registry.clone());
        let s2 = s1.clone();
        assert_eq!(registry.active_count(), 1);
        drop(s1);
        // The clone still pins seq 3.
        assert_eq!(registry.min_active(10), 3);
        drop(s2);
        assert_eq!(registry.active_count(), 0);
    }
}
