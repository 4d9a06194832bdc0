//! Index maintenance dispatch.
//!
//! The entity layer calls [`apply_record_change`] with the `{before,
//! after}` pair of every record mutation, inside the record's own
//! transaction. Each index defined over the collection stages its diff;
//! any error fails the whole transaction, which is what keeps a
//! committed record and its index entries inseparable.
//!
//! Vector indexes stage only their registry half here; the in-memory
//! graph halves come back as [`VectorChange`]s for the engine to apply
//! once the commit lands.

use crate::catalog::{Catalog, IndexKind};
use crate::vector::VectorChange;
use crate::{equality, fulltext, geo, range, ttl, vector};
use themis_core::error::Result;
use themis_core::key::Pk;
use themis_core::value::Value;
use themis_storage::StoreTxn;

/// Stage every index mutation derived from one record change. `before`
/// is the committed value the transaction read (None on insert),
/// `after` the new value (None on delete).
pub fn apply_record_change(
    txn: &mut StoreTxn,
    catalog: &Catalog,
    pk: &Pk,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<Vec<VectorChange>> {
    let pk_str = pk.to_string();
    let mut vector_changes = Vec::new();
    for descriptor in catalog.for_collection(pk.collection()) {
        if let Some(change) = apply_one(txn, &descriptor, &pk_str, before, after)? {
            vector_changes.push(change);
        }
    }
    Ok(vector_changes)
}

/// Stage the mutation of a single index for one record change. Used by
/// `apply_record_change` and by online rebuilds, which touch exactly
/// one descriptor.
pub fn apply_one(
    txn: &mut StoreTxn,
    descriptor: &crate::catalog::IndexDescriptor,
    pk: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<Option<VectorChange>> {
    match descriptor.kind() {
        IndexKind::Equality | IndexKind::Sparse => {
            equality::apply(txn, descriptor, pk, before, after)?;
            Ok(None)
        }
        IndexKind::Range => {
            range::apply(txn, descriptor, pk, before, after)?;
            Ok(None)
        }
        IndexKind::Geo => {
            geo::apply(txn, descriptor, pk, before, after)?;
            Ok(None)
        }
        IndexKind::Ttl => {
            ttl::apply(txn, descriptor, pk, before, after)?;
            Ok(None)
        }
        IndexKind::Fulltext => {
            fulltext::apply(txn, descriptor, pk, before, after)?;
            Ok(None)
        }
        IndexKind::Vector => vector::apply(txn, descriptor, pk, before, after),
        // Graph adjacency is edge-driven, not record-driven.
        IndexKind::Graph => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Collation, IndexConfig};
    use crate::fulltext::AnalyzerConfig;
    use crate::range::RangeBound;
    use themis_core::types::Direction;
    use themis_storage::Store;

    fn setup() -> (Store, Catalog) {
        let store = Store::in_memory();
        let catalog = Catalog::load(store.clone()).unwrap();
        catalog
            .create(
                "users_age",
                "users",
                vec!["age".into()],
                IndexConfig::Equality { unique: false },
            )
            .unwrap();
        catalog
            .create(
                "users_age_r",
                "users",
                vec!["age".into()],
                IndexConfig::Range {
                    collation: Collation::Binary,
                },
            )
            .unwrap();
        catalog
            .create(
                "users_bio_ft",
                "users",
                vec!["bio".into()],
                IndexConfig::Fulltext(AnalyzerConfig::default()),
            )
            .unwrap();
        (store, catalog)
    }

    fn user(age: i64, bio: &str) -> Value {
        Value::object([("age", Value::Int(age)), ("bio", Value::from(bio))])
    }

    #[test]
    fn test_all_indexes_updated_in_one_transaction() {
        let (store, catalog) = setup();
        let pk = Pk::new("users", "7").unwrap();

        let mut txn = store.begin();
        apply_record_change(&mut txn, &catalog, &pk, None, Some(&user(20, "likes hiking")))
            .unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        let eq = equality::scan_eq(
            &store,
            &snap,
            &catalog.get("users_age").unwrap(),
            &[Value::Int(20)],
            Direction::Forward,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(eq, vec!["users:7"]);

        let range_hits = range::scan(
            &store,
            &snap,
            &catalog.get("users_age_r").unwrap(),
            Some(&RangeBound::inclusive(Value::Int(20))),
            Some(&RangeBound::inclusive(Value::Int(20))),
            Direction::Forward,
            None,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(range_hits.len(), 1);

        let ft = fulltext::search(
            &store,
            &snap,
            &catalog.get("users_bio_ft").unwrap(),
            "hiking",
            10,
        )
        .unwrap();
        assert_eq!(ft[0].pk, "users:7");
    }

    #[test]
    fn test_abort_leaves_no_index_entries() {
        let (store, catalog) = setup();
        let pk = Pk::new("users", "7").unwrap();

        // Committed baseline at age 20.
        let mut txn = store.begin();
        apply_record_change(&mut txn, &catalog, &pk, None, Some(&user(20, "a"))).unwrap();
        txn.commit().unwrap();

        // Update to 25 inside a transaction that aborts.
        let mut txn = store.begin();
        apply_record_change(&mut txn, &catalog, &pk, Some(&user(20, "a")), Some(&user(25, "a")))
            .unwrap();
        txn.abort();

        let snap = store.snapshot();
        let desc = catalog.get("users_age").unwrap();
        assert_eq!(
            equality::scan_eq(&store, &snap, &desc, &[Value::Int(20)], Direction::Forward, usize::MAX)
                .unwrap(),
            vec!["users:7"]
        );
        assert!(equality::scan_eq(&store, &snap, &desc, &[Value::Int(25)], Direction::Forward, usize::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_delete_retracts_every_projection() {
        let (store, catalog) = setup();
        let pk = Pk::new("users", "7").unwrap();
        let record = user(20, "solitary words");

        let mut txn = store.begin();
        apply_record_change(&mut txn, &catalog, &pk, None, Some(&record)).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin();
        apply_record_change(&mut txn, &catalog, &pk, Some(&record), None).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        // The entire index column family is empty again.
        let remaining = store
            .prefix_iter(crate::keys::CF_INDEX, b"", &snap, Direction::Forward)
            .count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_vector_changes_surface_for_reconciliation() {
        let store = Store::in_memory();
        let catalog = Catalog::load(store.clone()).unwrap();
        catalog
            .create(
                "docs_vec",
                "docs",
                vec!["embedding".into()],
                IndexConfig::Vector(vector::VectorConfig::new(2, vector::Metric::L2)),
            )
            .unwrap();

        let pk = Pk::new("docs", "1").unwrap();
        let record = Value::object([("embedding", Value::Vector(vec![1.0, 2.0]))]);
        let mut txn = store.begin();
        let changes =
            apply_record_change(&mut txn, &catalog, &pk, None, Some(&record)).unwrap();
        txn.commit().unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], VectorChange::Upsert { pk, .. } if pk == "docs:1"));
    }

    #[test]
    fn test_other_collections_untouched() {
        let (store, catalog) = setup();
        let pk = Pk::new("orders", "1").unwrap();
        let mut txn = store.begin();
        let changes = apply_record_change(
            &mut txn,
            &catalog,
            &pk,
            None,
            Some(&user(99, "not indexed")),
        )
        .unwrap();
        txn.commit().unwrap();
        assert!(changes.is_empty());

        let snap = store.snapshot();
        let count = store
            .prefix_iter(crate::keys::CF_INDEX, b"", &snap, Direction::Forward)
            .count();
        assert_eq!(count, 0);
    }
}
