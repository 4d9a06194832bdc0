//! One column family: an ordered map of key to version chain.
//!
//! A version chain is the ascending list of `(commit_seq, value)` pairs
//! written for a key, tombstones included. Readers resolve the newest
//! version at or below their snapshot sequence, which gives MVCC reads
//! without cloning the map. Chains are trimmed on write: versions no
//! active snapshot can still observe are dropped.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use themis_core::types::Direction;

/// Ascending `(seq, value)` history of one key. `None` is a tombstone.
#[derive(Debug, Default, Clone)]
pub struct VersionChain {
    versions: Vec<(u64, Option<Vec<u8>>)>,
}

impl VersionChain {
    /// Newest version visible at `seq`, if any.
    fn visible_at(&self, seq: u64) -> Option<&Option<Vec<u8>>> {
        self.versions
            .iter()
            .rev()
            .find(|(s, _)| *s <= seq)
            .map(|(_, v)| v)
    }

    /// Sequence of the newest version, 0 for an empty chain.
    fn latest_seq(&self) -> u64 {
        self.versions.last().map(|(s, _)| *s).unwrap_or(0)
    }

    /// Append a version. Sequences only grow.
    fn push(&mut self, seq: u64, value: Option<Vec<u8>>) {
        debug_assert!(seq >= self.latest_seq());
        self.versions.push((seq, value));
    }

    /// Drop versions that no snapshot at or above `min_active` can see:
    /// everything older than the newest version at or below the bound.
    fn trim(&mut self, min_active: u64) {
        let keep_from = self
            .versions
            .iter()
            .rposition(|(s, _)| *s <= min_active)
            .unwrap_or(0);
        if keep_from > 0 {
            self.versions.drain(..keep_from);
        }
    }

    /// True once every version is gone or only a trimmed tombstone
    /// remains that nobody can observe.
    fn is_garbage(&self, min_active: u64) -> bool {
        self.versions.len() == 1
            && self.versions[0].1.is_none()
            && self.versions[0].0 <= min_active
    }
}

/// An ordered, versioned column family.
#[derive(Debug, Default)]
pub struct Memtable {
    data: RwLock<BTreeMap<Vec<u8>, VersionChain>>,
}

impl Memtable {
    /// Create an empty memtable.
    pub fn new() -> Self {
        Memtable::default()
    }

    /// Read the value of `key` visible at `seq`.
    pub fn get_at(&self, key: &[u8], seq: u64) -> Option<Vec<u8>> {
        let data = self.data.read();
        data.get(key)
            .and_then(|chain| chain.visible_at(seq))
            .and_then(|v| v.clone())
    }

    /// Sequence of the newest committed version of `key`, 0 when the key
    /// was never written. Used for write-conflict checks at lock time.
    pub fn latest_seq(&self, key: &[u8]) -> u64 {
        let data = self.data.read();
        data.get(key).map(|c| c.latest_seq()).unwrap_or(0)
    }

    /// Apply one committed write, trimming the chain against the oldest
    /// active snapshot.
    pub fn apply(&self, key: &[u8], seq: u64, value: Option<Vec<u8>>, min_active: u64) {
        let mut data = self.data.write();
        let chain = data.entry(key.to_vec()).or_default();
        chain.push(seq, value);
        chain.trim(min_active);
        if chain.is_garbage(min_active) {
            data.remove(key);
        }
    }

    /// Fetch up to `limit` live entries visible at `seq` inside
    /// `[lo, hi)`, strictly after `after` (strictly before, when the
    /// direction is reverse). This is the batch primitive the lazy
    /// iterators refill from; the read lock is held only per batch.
    pub fn scan_batch(
        &self,
        lo: &[u8],
        hi: Option<&[u8]>,
        after: Option<&[u8]>,
        seq: u64,
        direction: Direction,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        let mut out = Vec::with_capacity(limit.min(64));

        let lower: Bound<&[u8]>;
        let upper: Bound<&[u8]>;
        match direction {
            Direction::Forward => {
                lower = match after {
                    Some(a) => Bound::Excluded(a),
                    None => Bound::Included(lo),
                };
                upper = match hi {
                    Some(h) => Bound::Excluded(h),
                    None => Bound::Unbounded,
                };
                for (k, chain) in data.range::<[u8], _>((lower, upper)) {
                    if let Some(Some(v)) = chain.visible_at(seq).map(|v| v.as_ref()) {
                        out.push((k.clone(), v.clone()));
                        if out.len() >= limit {
                            break;
                        }
                    }
                }
            }
            Direction::Reverse => {
                lower = Bound::Included(lo);
                upper = match after {
                    Some(a) => Bound::Excluded(a),
                    None => match hi {
                        Some(h) => Bound::Excluded(h),
                        None => Bound::Unbounded,
                    },
                };
                for (k, chain) in data.range::<[u8], _>((lower, upper)).rev() {
                    if let Some(Some(v)) = chain.visible_at(seq).map(|v| v.as_ref()) {
                        out.push((k.clone(), v.clone()));
                        if out.len() >= limit {
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Materialize the full live state at `seq` for snapshot files.
    pub fn dump_at(&self, seq: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        data.iter()
            .filter_map(|(k, chain)| match chain.visible_at(seq) {
                Some(Some(v)) => Some((k.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of keys with at least one version (tombstones included).
    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_at_resolves_snapshot() {
        let mem = Memtable::new();
        mem.apply(b"k", 1, Some(b"v1".to_vec()), 0);
        mem.apply(b"k", 3, Some(b"v3".to_vec()), 0);

        assert_eq!(mem.get_at(b"k", 0), None);
        assert_eq!(mem.get_at(b"k", 1), Some(b"v1".to_vec()));
        assert_eq!(mem.get_at(b"k", 2), Some(b"v1".to_vec()));
        assert_eq!(mem.get_at(b"k", 3), Some(b"v3".to_vec()));
        assert_eq!(mem.get_at(b"k", 99), Some(b"v3".to_vec()));
    }

    #[test]
    fn test_tombstone_hides_value() {
        let mem = Memtable::new();
        mem.apply(b"k", 1, Some(b"v".to_vec()), 0);
        mem.apply(b"k", 2, None, 0);

        assert_eq!(mem.get_at(b"k", 1), Some(b"v".to_vec()));
        assert_eq!(mem.get_at(b"k", 2), None);
    }

    #[test]
    fn test_trim_respects_active_snapshot() {
        let mem = Memtable::new();
        mem.apply(b"k", 1, Some(b"v1".to_vec()), 0);
        // A snapshot at seq 1 is still active, so v1 must survive the
        // next write's trim.
        mem.apply(b"k", 2, Some(b"v2".to_vec()), 1);
        assert_eq!(mem.get_at(b"k", 1), Some(b"v1".to_vec()));

        // Once the oldest active snapshot moves to 2, a further write
        // may drop v1.
        mem.apply(b"k", 3, Some(b"v3".to_vec()), 2);
        assert_eq!(mem.get_at(b"k", 2), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_garbage_tombstone_removed() {
        let mem = Memtable::new();
        mem.apply(b"k", 1, Some(b"v".to_vec()), 0);
        mem.apply(b"k", 2, None, 2);
        assert_eq!(mem.key_count(), 0);
    }

    #[test]
    fn test_scan_batch_forward_and_reverse() {
        let mem = Memtable::new();
        for (i, k) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            mem.apply(*k, (i + 1) as u64, Some(vec![i as u8]), 0);
        }

        let all = mem.scan_batch(b"a", None, None, 10, Direction::Forward, 100);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].0, b"a");
        assert_eq!(all[3].0, b"d");

        let after_b = mem.scan_batch(b"a", None, Some(b"b"), 10, Direction::Forward, 100);
        assert_eq!(after_b[0].0, b"c");

        let rev = mem.scan_batch(b"a", None, None, 10, Direction::Reverse, 100);
        assert_eq!(rev[0].0, b"d");
        assert_eq!(rev[3].0, b"a");

        let before_c = mem.scan_batch(b"a", None, Some(b"c"), 10, Direction::Reverse, 100);
        assert_eq!(before_c[0].0, b"b");
    }

    #[test]
    fn test_scan_batch_respects_snapshot_and_bounds() {
        let mem = Memtable::new();
        mem.apply(b"a", 1, Some(b"1".to_vec()), 0);
        mem.apply(b"b", 5, Some(b"5".to_vec()), 0);
        mem.apply(b"c", 1, Some(b"1".to_vec()), 0);

        // Snapshot at 1 does not see "b".
        let visible = mem.scan_batch(b"a", None, None, 1, Direction::Forward, 100);
        let keys: Vec<_> = visible.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);

        // Upper bound is exclusive.
        let bounded = mem.scan_batch(b"a", Some(b"c"), None, 10, Direction::Forward, 100);
        let keys: Vec<_> = bounded.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_dump_at_skips_tombstones() {
        let mem = Memtable::new();
        mem.apply(b"a", 1, Some(b"1".to_vec()), 0);
        mem.apply(b"b", 2, Some(b"2".to_vec()), 0);
        mem.apply(b"b", 3, None, 0);

        let dump = mem.dump_at(3);
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].0, b"a");
    }
}
