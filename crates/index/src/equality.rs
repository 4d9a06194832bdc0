//! Equality, composite, and sparse indexes.
//!
//! Entry layout: `{prefix}:{name}:` + encoded value(s) + pk. Equality
//! indexes encode missing fields as null so every record has exactly one
//! entry; sparse indexes skip records whose field is null or missing,
//! which keeps them smaller at the cost of not answering null lookups.
//!
//! Unique indexes check for a conflicting pk at write time inside the
//! same transaction (buffered writes included), so a violation aborts
//! the whole transaction.

use crate::catalog::{IndexConfig, IndexDescriptor, IndexKind};
use crate::keys::{entry_key, index_prefix, prefix, split_entry_suffix, CF_INDEX};
use themis_core::encoding::encode_index_value;
use themis_core::error::{Result, ThemisError};
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_storage::{Snapshot, Store, StoreTxn};

fn kind_prefix(descriptor: &IndexDescriptor) -> &'static str {
    match descriptor.kind() {
        IndexKind::Sparse => prefix::SPARSE,
        _ => prefix::EQUALITY,
    }
}

fn is_unique(descriptor: &IndexDescriptor) -> bool {
    matches!(
        descriptor.config,
        IndexConfig::Equality { unique: true } | IndexConfig::Sparse { unique: true }
    )
}

/// Encode the indexable projection of `value` for this index, or `None`
/// when the index produces no entry (sparse with null/missing field).
pub fn project(descriptor: &IndexDescriptor, value: &Value) -> Result<Option<Vec<u8>>> {
    let sparse = descriptor.kind() == IndexKind::Sparse;
    let mut out = Vec::new();
    for field in &descriptor.fields {
        let field_value = value.get_path(field).unwrap_or(&Value::Null);
        if sparse && field_value.is_null() {
            return Ok(None);
        }
        out.extend(encode_index_value(field_value, false)?);
    }
    Ok(Some(out))
}

/// Stage the index mutation for one record change.
pub fn apply(
    txn: &mut StoreTxn,
    descriptor: &IndexDescriptor,
    pk: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<()> {
    let kp = kind_prefix(descriptor);
    let old = match before {
        Some(v) => project(descriptor, v)?,
        None => None,
    };
    let new = match after {
        Some(v) => project(descriptor, v)?,
        None => None,
    };
    if old == new {
        return Ok(());
    }
    if let Some(encoded) = old {
        txn.delete(CF_INDEX, &entry_key(kp, &descriptor.name, &encoded, pk))?;
    }
    if let Some(encoded) = new {
        if is_unique(descriptor) {
            let mut probe = index_prefix(kp, &descriptor.name);
            probe.extend_from_slice(&encoded);
            for (key, _) in txn.scan_prefix(CF_INDEX, &probe) {
                let suffix = &key[index_prefix(kp, &descriptor.name).len()..];
                let (_, existing_pk) = split_entry_suffix(suffix, descriptor.fields.len())?;
                if existing_pk != pk {
                    return Err(ThemisError::schema_violation(format!(
                        "unique index '{}' already maps this value to {}",
                        descriptor.name, existing_pk
                    )));
                }
            }
        }
        txn.put(CF_INDEX, &entry_key(kp, &descriptor.name, &encoded, pk), b"")?;
    }
    Ok(())
}

/// Sorted pks whose indexed value equals `values` (one per field).
pub fn scan_eq(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    values: &[Value],
    direction: Direction,
    limit: usize,
) -> Result<Vec<String>> {
    if values.len() != descriptor.fields.len() {
        return Err(ThemisError::internal(format!(
            "index '{}' expects {} lookup values, got {}",
            descriptor.name,
            descriptor.fields.len(),
            values.len()
        )));
    }
    let kp = kind_prefix(descriptor);
    let mut probe = index_prefix(kp, &descriptor.name);
    for value in values {
        probe.extend(encode_index_value(value, false)?);
    }
    let prefix_len = probe.len();
    let mut out = Vec::new();
    for (key, _) in store.prefix_iter(CF_INDEX, &probe, snapshot, direction) {
        out.push(String::from_utf8_lossy(&key[prefix_len..]).into_owned());
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

/// Count entries for a value, stopping at `cap`. The optimizer's
/// selectivity probe.
pub fn probe_count(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    values: &[Value],
    cap: usize,
) -> Result<usize> {
    Ok(scan_eq(store, snapshot, descriptor, values, Direction::Forward, cap)?.len())
}

/// Delete every entry of this index (drop / rebuild).
pub fn clear(store: &Store, descriptor: &IndexDescriptor) -> Result<()> {
    let kp = kind_prefix(descriptor);
    let probe = index_prefix(kp, &descriptor.name);
    let snapshot = store.snapshot();
    let keys: Vec<_> = store
        .prefix_iter(CF_INDEX, &probe, &snapshot, Direction::Forward)
        .map(|(k, _)| k)
        .collect();
    for chunk in keys.chunks(512) {
        let mut txn = store.begin();
        for key in chunk {
            txn.delete(CF_INDEX, key)?;
        }
        txn.commit()?;
    }
    Ok(())
}
