//! Lazy, bounded, monotonic range iterators.
//!
//! Iterators pull batches of entries from the memtable, releasing the
//! read lock between refills, so a long scan never holds a lock while
//! the caller processes rows. The cursor position is the last delivered
//! key, which makes iteration monotonic even while concurrent writers
//! commit (their writes are invisible anyway: the iterator reads at a
//! fixed snapshot sequence).

use crate::memtable::Memtable;
use crate::snapshot::Snapshot;
use std::collections::VecDeque;
use std::sync::Arc;
use themis_core::types::Direction;

/// Entries fetched per lock acquisition.
const BATCH_SIZE: usize = 128;

/// Streaming iterator over `[lo, hi)` of one column family at a fixed
/// snapshot. `hi = None` means "to the end of the prefix range given by
/// lo's successor" is the caller's concern; here it simply means
/// unbounded above.
pub struct RangeIter {
    mem: Arc<Memtable>,
    snapshot: Snapshot,
    lo: Vec<u8>,
    hi: Option<Vec<u8>>,
    direction: Direction,
    cursor: Option<Vec<u8>>,
    batch: VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

impl RangeIter {
    pub(crate) fn new(
        mem: Arc<Memtable>,
        snapshot: Snapshot,
        lo: Vec<u8>,
        hi: Option<Vec<u8>>,
        direction: Direction,
        start_after: Option<Vec<u8>>,
    ) -> Self {
        RangeIter {
            mem,
            snapshot,
            lo,
            hi,
            direction,
            cursor: start_after,
            batch: VecDeque::new(),
            exhausted: false,
        }
    }

    fn refill(&mut self) {
        let fetched = self.mem.scan_batch(
            &self.lo,
            self.hi.as_deref(),
            self.cursor.as_deref(),
            self.snapshot.seq(),
            self.direction,
            BATCH_SIZE,
        );
        if fetched.len() < BATCH_SIZE {
            self.exhausted = true;
        }
        if let Some((last_key, _)) = fetched.last() {
            self.cursor = Some(last_key.clone());
        }
        self.batch.extend(fetched);
    }
}

impl Iterator for RangeIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() && !self.exhausted {
            self.refill();
        }
        self.batch.pop_front()
    }
}

/// Smallest byte string strictly greater than every string with this
/// prefix, or `None` when the prefix is all 0xFF (unbounded above).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotRegistry;

    fn setup() -> (Arc<Memtable>, Arc<SnapshotRegistry>) {
        let mem = Arc::new(Memtable::new());
        for i in 0..300u32 {
            let key = format!("k{:04}", i);
            mem.apply(key.as_bytes(), 1, Some(i.to_be_bytes().to_vec()), 0);
        }
        (mem, Arc::new(SnapshotRegistry::new()))
    }

    #[test]
    fn test_iterates_across_batches_in_order() {
        let (mem, registry) = setup();
        let snapshot = Snapshot::pin(1, registry);
        let iter = RangeIter::new(mem, snapshot, b"k".to_vec(), None, Direction::Forward, None);
        let keys: Vec<_> = iter.map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 300);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_reverse_iteration() {
        let (mem, registry) = setup();
        let snapshot = Snapshot::pin(1, registry);
        let iter = RangeIter::new(mem, snapshot, b"k".to_vec(), None, Direction::Reverse, None);
        let keys: Vec<_> = iter.map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 300);
        assert!(keys.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(keys[0], b"k0299".to_vec());
    }

    #[test]
    fn test_start_after_resumes() {
        let (mem, registry) = setup();
        let snapshot = Snapshot::pin(1, registry);
        let iter = RangeIter::new(
            mem,
            snapshot,
            b"k".to_vec(),
            None,
            Direction::Forward,
            Some(b"k0009".to_vec()),
        );
        let first = iter.take(1).next().unwrap().0;
        assert_eq!(first, b"k0010".to_vec());
    }

    #[test]
    fn test_upper_bound_respected() {
        let (mem, registry) = setup();
        let snapshot = Snapshot::pin(1, registry);
        let iter = RangeIter::new(
            mem,
            snapshot,
            b"k0000".to_vec(),
            Some(b"k0010".to_vec()),
            Direction::Forward,
            None,
        );
        assert_eq!(iter.count(), 10);
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_upper_bound(b"ab\xff"), Some(b"ac".to_vec()));
        assert_eq!(prefix_upper_bound(b"\xff\xff"), None);
    }
}
