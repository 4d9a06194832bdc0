//! The entity layer.
//!
//! A record is a tagged value tree plus a strictly increasing version
//! and an xxh3 content hash of the canonical JSON form. Records are
//! bincode-encoded in the `entities` column family under
//! `collection:key`, so a collection scan is a prefix walk in pk order.

use serde::{Deserialize, Serialize};
use themis_core::error::Result;
use themis_core::key::Pk;
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_index::keys::CF_ENTITIES;
use themis_storage::{Snapshot, Store, StoreTxn};

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The payload.
    pub value: Value,
    /// Monotonic per-record version, starting at 1.
    pub version: u64,
    /// xxh3 of the canonical JSON form of `value`.
    pub hash: u64,
}

impl Record {
    fn new(value: Value, version: u64) -> Self {
        let hash = value.content_hash();
        Record {
            value,
            version,
            hash,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Read a record inside a transaction (read-your-writes).
pub fn get_txn(txn: &StoreTxn, pk: &Pk) -> Result<Option<Record>> {
    match txn.get(CF_ENTITIES, &pk.encode()) {
        Some(bytes) => Ok(Some(Record::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Read a record at a snapshot.
pub fn get_snapshot(store: &Store, snapshot: &Snapshot, pk: &Pk) -> Result<Option<Record>> {
    match store.get(CF_ENTITIES, &pk.encode(), snapshot) {
        Some(bytes) => Ok(Some(Record::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Write a record inside a transaction: read the prior version under
/// the same snapshot, bump it, recompute the hash, and stage the write.
/// Returns the prior value (for index maintenance) and the new record.
pub fn put_txn(txn: &mut StoreTxn, pk: &Pk, value: Value) -> Result<(Option<Record>, Record)> {
    let before = get_txn(txn, pk)?;
    let version = before.as_ref().map(|r| r.version + 1).unwrap_or(1);
    let record = Record::new(value, version);
    txn.put(CF_ENTITIES, &pk.encode(), &record.encode()?)?;
    Ok((before, record))
}

/// Delete a record inside a transaction. Returns the prior record, if
/// any (the index layer needs it to retract projections).
pub fn delete_txn(txn: &mut StoreTxn, pk: &Pk) -> Result<Option<Record>> {
    let before = get_txn(txn, pk)?;
    if before.is_some() {
        txn.delete(CF_ENTITIES, &pk.encode())?;
    }
    Ok(before)
}

/// Scan a collection in pk order at a snapshot, starting strictly after
/// `start_after` when given.
pub fn scan_collection(
    store: &Store,
    snapshot: &Snapshot,
    collection: &str,
    direction: Direction,
    start_after: Option<&Pk>,
) -> impl Iterator<Item = Result<(Pk, Record)>> {
    let prefix = Pk::collection_prefix(collection);
    let hi = themis_storage::iter::prefix_upper_bound(&prefix);
    store
        .range_iter(
            CF_ENTITIES,
            &prefix,
            hi.as_deref(),
            snapshot,
            direction,
            start_after.map(|pk| pk.encode()),
        )
        .map(|(key, value)| {
            let pk = Pk::decode(&key)?;
            let record = Record::decode(&value)?;
            Ok((pk, record))
        })
}
