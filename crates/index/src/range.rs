//! Range / order index.
//!
//! Entry layout: `ridx:{name}:` + order-preserving encoded value + pk.
//! Because the encoding sorts the way the values do, a key-range walk
//! delivers pks in (value, pk) order, which is what lets `SORT` stream
//! off this index and what makes cursor resumption a strictly-after
//! seek. Missing fields index as null, which sorts before every real
//! value.

use crate::catalog::{Collation, IndexConfig, IndexDescriptor};
use crate::keys::{entry_key, index_prefix, prefix, split_entry_suffix, CF_INDEX};
use themis_core::encoding::encode_index_value;
use themis_core::error::{Result, ThemisError};
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_storage::iter::prefix_upper_bound;
use themis_storage::{Snapshot, Store, StoreTxn};

fn natural(descriptor: &IndexDescriptor) -> bool {
    matches!(
        descriptor.config,
        IndexConfig::Range {
            collation: Collation::Natural
        }
    )
}

/// One endpoint of a range predicate.
#[derive(Debug, Clone)]
pub struct RangeBound {
    /// Endpoint value.
    pub value: Value,
    /// Whether the endpoint itself is included.
    pub inclusive: bool,
}

impl RangeBound {
    /// An inclusive endpoint.
    pub fn inclusive(value: Value) -> Self {
        RangeBound {
            value,
            inclusive: true,
        }
    }

    /// An exclusive endpoint.
    pub fn exclusive(value: Value) -> Self {
        RangeBound {
            value,
            inclusive: false,
        }
    }
}

/// A `(sort_key, pk)` pair delivered by a range scan. The sort key is
/// the encoded value, which downstream paging embeds in cursor tokens.
pub type RangeEntry = (Vec<u8>, String);

/// Stage the index mutation for one record change.
pub fn apply(
    txn: &mut StoreTxn,
    descriptor: &IndexDescriptor,
    pk: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<()> {
    let field = &descriptor.fields[0];
    let nat = natural(descriptor);
    let old = match before {
        Some(v) => Some(encode_index_value(v.get_path(field).unwrap_or(&Value::Null), nat)?),
        None => None,
    };
    let new = match after {
        Some(v) => Some(encode_index_value(v.get_path(field).unwrap_or(&Value::Null), nat)?),
        None => None,
    };
    if old == new {
        return Ok(());
    }
    if let Some(encoded) = old {
        txn.delete(CF_INDEX, &entry_key(prefix::RANGE, &descriptor.name, &encoded, pk))?;
    }
    if let Some(encoded) = new {
        txn.put(CF_INDEX, &entry_key(prefix::RANGE, &descriptor.name, &encoded, pk), b"")?;
    }
    Ok(())
}

/// Encode a lookup value under this index's collation.
pub fn encode_bound_value(descriptor: &IndexDescriptor, value: &Value) -> Result<Vec<u8>> {
    encode_index_value(value, natural(descriptor))
}

/// Ordered scan of `[lo, hi]` (either side optional), optionally
/// resuming strictly after a `(sort_key, pk)` position from a cursor.
///
/// Entries arrive in (value, pk) order for `Forward` and the exact
/// reverse for `Reverse`; ties on the value are broken by pk either way.
pub fn scan(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    lo: Option<&RangeBound>,
    hi: Option<&RangeBound>,
    direction: Direction,
    start_after: Option<&(Vec<u8>, String)>,
    limit: usize,
) -> Result<Vec<RangeEntry>> {
    let base = index_prefix(prefix::RANGE, &descriptor.name);

    // Lower key bound of the walk.
    let lo_key = match lo {
        Some(bound) => {
            let mut key = base.clone();
            let encoded = encode_bound_value(descriptor, &bound.value)?;
            if bound.inclusive {
                key.extend_from_slice(&encoded);
            } else {
                // Exclusive low endpoint: skip the whole run of entries
                // carrying this value.
                let mut run = base.clone();
                run.extend_from_slice(&encoded);
                key = prefix_upper_bound(&run).ok_or_else(|| {
                    ThemisError::internal("range lower bound has no successor")
                })?;
            }
            key
        }
        None => base.clone(),
    };

    // Exclusive upper key bound of the walk.
    let hi_key = match hi {
        Some(bound) => {
            let mut run = base.clone();
            run.extend_from_slice(&encode_bound_value(descriptor, &bound.value)?);
            if bound.inclusive {
                prefix_upper_bound(&run)
            } else {
                Some(run)
            }
        }
        None => prefix_upper_bound(&base),
    };

    let resume = start_after.map(|(sort_key, pk)| {
        let mut key = base.clone();
        key.extend_from_slice(sort_key);
        key.extend_from_slice(pk.as_bytes());
        key
    });

    let mut out = Vec::new();
    let iter = store.range_iter(
        CF_INDEX,
        &lo_key,
        hi_key.as_deref(),
        snapshot,
        direction,
        resume,
    );
    for (key, _) in iter {
        let suffix = &key[base.len()..];
        let (sort_key, pk) = split_entry_suffix(suffix, 1)?;
        out.push((sort_key, pk));
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

/// Estimate range cardinality by probing up to `cap` entries.
pub fn probe_count(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    lo: Option<&RangeBound>,
    hi: Option<&RangeBound>,
    cap: usize,
) -> Result<usize> {
    Ok(scan(store, snapshot, descriptor, lo, hi, Direction::Forward, None, cap)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(collation: Collation) -> IndexDescriptor {
        IndexDescriptor {
            name: "users_age_r".into(),
            collection: "users".into(),
            fields: vec!["age".into()],
            config: IndexConfig::Range { collation },
            schema_version: 1,
        }
    }

    fn seed(store: &Store, desc: &IndexDescriptor, ages: &[i64]) {
        let mut txn = store.begin();
        for (i, age) in ages.iter().enumerate() {
            let record = Value::object([("age", Value::Int(*age))]);
            apply(&mut txn, desc, &format!("users:{:03}", i), None, Some(&record)).unwrap();
        }
        txn.commit().unwrap();
    }

    fn pks(entries: &[RangeEntry]) -> Vec<&str> {
        entries.iter().map(|(_, pk)| pk.as_str()).collect()
    }

    #[test]
    fn test_full_ordered_scan() {
        let store = Store::in_memory();
        let desc = descriptor(Collation::Binary);
        seed(&store, &desc, &[30, 10, 20]);

        let snap = store.snapshot();
        let entries =
            scan(&store, &snap, &desc, None, None, Direction::Forward, None, usize::MAX).unwrap();
        // Value order, not insertion order.
        assert_eq!(pks(&entries), vec!["users:001", "users:002", "users:000"]);

        let reversed =
            scan(&store, &snap, &desc, None, None, Direction::Reverse, None, usize::MAX).unwrap();
        assert_eq!(pks(&reversed), vec!["users:000", "users:002", "users:001"]);
    }

    #[test]
    fn test_bounds_inclusive_and_exclusive() {
        let store = Store::in_memory();
        let desc = descriptor(Collation::Binary);
        seed(&store, &desc, &[10, 20, 30, 40]);
        let snap = store.snapshot();

        let ge20 = scan(
            &store,
            &snap,
            &desc,
            Some(&RangeBound::inclusive(Value::Int(20))),
            None,
            Direction::Forward,
            None,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(pks(&ge20).len(), 3);

        let gt20 = scan(
            &store,
            &snap,
            &desc,
            Some(&RangeBound::exclusive(Value::Int(20))),
            None,
            Direction::Forward,
            None,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(pks(&gt20).len(), 2);

        let le30 = scan(
            &store,
            &snap,
            &desc,
            None,
            Some(&RangeBound::inclusive(Value::Int(30))),
            Direction::Forward,
            None,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(pks(&le30).len(), 3);

        let lt30 = scan(
            &store,
            &snap,
            &desc,
            None,
            Some(&RangeBound::exclusive(Value::Int(30))),
            Direction::Forward,
            None,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(pks(&lt30).len(), 2);

        let window = scan(
            &store,
            &snap,
            &desc,
            Some(&RangeBound::inclusive(Value::Int(20))),
            Some(&RangeBound::exclusive(Value::Int(40))),
            Direction::Forward,
            None,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(pks(&window).len(), 2);
    }

    #[test]
    fn test_ties_break_by_pk_and_resume() {
        let store = Store::in_memory();
        let desc = descriptor(Collation::Binary);
        seed(&store, &desc, &[20, 20, 20, 30]);
        let snap = store.snapshot();

        let all =
            scan(&store, &snap, &desc, None, None, Direction::Forward, None, usize::MAX).unwrap();
        assert_eq!(
            pks(&all),
            vec!["users:000", "users:001", "users:002", "users:003"]
        );

        // Resume strictly after the second tie.
        let resume_pos = all[1].clone();
        let rest = scan(
            &store,
            &snap,
            &desc,
            None,
            None,
            Direction::Forward,
            Some(&resume_pos),
            usize::MAX,
        )
        .unwrap();
        assert_eq!(pks(&rest), vec!["users:002", "users:003"]);

        // Reverse resume is strictly before.
        let rest_rev = scan(
            &store,
            &snap,
            &desc,
            None,
            None,
            Direction::Reverse,
            Some(&resume_pos),
            usize::MAX,
        )
        .unwrap();
        assert_eq!(pks(&rest_rev), vec!["users:000"]);
    }

    #[test]
    fn test_update_moves_entry() {
        let store = Store::in_memory();
        let desc = descriptor(Collation::Binary);
        seed(&store, &desc, &[20]);

        let before = Value::object([("age", Value::Int(20))]);
        let after = Value::object([("age", Value::Int(25))]);
        let mut txn = store.begin();
        apply(&mut txn, &desc, "users:000", Some(&before), Some(&after)).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        let at20 = scan(
            &store,
            &snap,
            &desc,
            Some(&RangeBound::inclusive(Value::Int(20))),
            Some(&RangeBound::inclusive(Value::Int(20))),
            Direction::Forward,
            None,
            usize::MAX,
        )
        .unwrap();
        assert!(at20.is_empty());
    }

    #[test]
    fn test_natural_collation_groups_case() {
        let store = Store::in_memory();
        let desc = IndexDescriptor {
            name: "users_name_r".into(),
            collection: "users".into(),
            fields: vec!["name".into()],
            config: IndexConfig::Range {
                collation: Collation::Natural,
            },
            schema_version: 1,
        };
        let mut txn = store.begin();
        for (i, name) in ["Zoe", "adam", "Adam"].iter().enumerate() {
            let record = Value::object([("name", Value::from(*name))]);
            apply(&mut txn, &desc, &format!("users:{}", i), None, Some(&record)).unwrap();
        }
        txn.commit().unwrap();

        let snap = store.snapshot();
        let entries =
            scan(&store, &snap, &desc, None, None, Direction::Forward, None, usize::MAX).unwrap();
        // "adam"/"Adam" group together ahead of "Zoe" under natural
        // collation; binary would put the capitals first.
        assert_eq!(pks(&entries), vec!["users:1", "users:2", "users:0"]);
    }

    #[test]
    fn test_nulls_sort_first() {
        let store = Store::in_memory();
        let desc = descriptor(Collation::Binary);
        let mut txn = store.begin();
        apply(
            &mut txn,
            &desc,
            "users:a",
            None,
            Some(&Value::object([] as [(&str, Value); 0])),
        )
        .unwrap();
        apply(
            &mut txn,
            &desc,
            "users:b",
            None,
            Some(&Value::object([("age", Value::Int(1))])),
        )
        .unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        let entries =
            scan(&store, &snap, &desc, None, None, Direction::Forward, None, usize::MAX).unwrap();
        assert_eq!(pks(&entries), vec!["users:a", "users:b"]);
    }

    #[test]
    fn test_probe_count() {
        let store = Store::in_memory();
        let desc = descriptor(Collation::Binary);
        seed(&store, &desc, &(0..50).collect::<Vec<_>>());
        let snap = store.snapshot();
        let estimate = probe_count(
            &store,
            &snap,
            &desc,
            Some(&RangeBound::inclusive(Value::Int(10))),
            Some(&RangeBound::inclusive(Value::Int(19))),
            64,
        )
        .unwrap();
        assert_eq!(estimate, 10);
    }
}
