//! TTL index: expiry keys for the expired-record sweep.
//!
//! The expiry is `field + ttl_seconds`, where the field holds either an
//! epoch-milliseconds integer or an ISO-8601 timestamp string. Entries
//! sort by expiry, so the sweep is a range walk over `[-inf, now]`. The
//! sweep itself deletes records through ordinary transactions; the index
//! only answers "what has expired".

use crate::catalog::{IndexConfig, IndexDescriptor};
use crate::keys::{index_prefix, prefix, CF_INDEX};
use chrono::DateTime;
use themis_core::encoding::{encode_i64, decode_i64};
use themis_core::error::{Result, ThemisError};
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_storage::{Snapshot, Store, StoreTxn};

fn config(descriptor: &IndexDescriptor) -> Result<(&str, i64)> {
    match &descriptor.config {
        IndexConfig::Ttl { field, ttl_seconds } => Ok((field, *ttl_seconds)),
        _ => Err(ThemisError::internal(format!(
            "index '{}' is not a TTL index",
            descriptor.name
        ))),
    }
}

/// Parse the base timestamp of a record: epoch millis or ISO-8601.
fn base_epoch_ms(value: &Value) -> Result<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Int(ms) => Ok(Some(*ms)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.timestamp_millis()))
            .map_err(|_| {
                ThemisError::schema_violation(format!(
                    "'{}' is not an ISO-8601 timestamp",
                    s
                ))
            }),
        other => Err(ThemisError::schema_violation(format!(
            "TTL base field must be a timestamp, got {:?}",
            std::mem::discriminant(other)
        ))),
    }
}

fn expiry_of(descriptor: &IndexDescriptor, value: &Value) -> Result<Option<i64>> {
    let (field, ttl_seconds) = config(descriptor)?;
    let base = match value.get_path(field) {
        Some(v) => base_epoch_ms(v)?,
        None => None,
    };
    Ok(base.map(|ms| ms.saturating_add(ttl_seconds.saturating_mul(1000))))
}

fn entry_key(descriptor: &IndexDescriptor, expiry_ms: i64, pk: &str) -> Vec<u8> {
    let mut key = index_prefix(prefix::TTL, &descriptor.name);
    key.extend_from_slice(&encode_i64(expiry_ms));
    key.extend_from_slice(pk.as_bytes());
    key
}

/// Stage the index mutation for one record change.
pub fn apply(
    txn: &mut StoreTxn,
    descriptor: &IndexDescriptor,
    pk: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<()> {
    let old = match before {
        Some(v) => expiry_of(descriptor, v)?,
        None => None,
    };
    let new = match after {
        Some(v) => expiry_of(descriptor, v)?,
        None => None,
    };
    if old == new {
        return Ok(());
    }
    if let Some(expiry) = old {
        txn.delete(CF_INDEX, &entry_key(descriptor, expiry, pk))?;
    }
    if let Some(expiry) = new {
        txn.put(CF_INDEX, &entry_key(descriptor, expiry, pk), b"")?;
    }
    Ok(())
}

/// Pks whose expiry is at or before `now_ms`, oldest first, up to
/// `limit`. Feeds the sweep.
pub fn scan_expired(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    now_ms: i64,
    limit: usize,
) -> Result<Vec<(i64, String)>> {
    let base = index_prefix(prefix::TTL, &descriptor.name);
    let mut hi = base.clone();
    // Inclusive upper bound: everything expiring at exactly `now_ms`
    // still counts as expired.
    hi.extend_from_slice(&encode_i64(now_ms.saturating_add(1)));

    let mut out = Vec::new();
    for (key, _) in store.range_iter(CF_INDEX, &base, Some(&hi), snapshot, Direction::Forward, None)
    {
        let suffix = &key[base.len()..];
        let expiry = decode_i64(&suffix[..8]);
        let pk = String::from_utf8_lossy(&suffix[8..]).into_owned();
        out.push((expiry, pk));
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor {
            name: "sessions_ttl".into(),
            collection: "sessions".into(),
            fields: vec!["created_at".into()],
            config: IndexConfig::Ttl {
                field: "created_at".into(),
                ttl_seconds: 60,
            },
            schema_version: 1,
        }
    }

    fn session(created_ms: i64) -> Value {
        Value::object([("created_at", Value::Int(created_ms))])
    }

    #[test]
    fn test_expiry_is_base_plus_ttl() {
        let store = Store::in_memory();
        let desc = descriptor();
        let mut txn = store.begin();
        apply(&mut txn, &desc, "sessions:a", None, Some(&session(1_000))).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        // Expiry = 1_000 + 60s.
        assert!(scan_expired(&store, &snap, &desc, 60_999, 10).unwrap().is_empty());
        let expired = scan_expired(&store, &snap, &desc, 61_000, 10).unwrap();
        assert_eq!(expired, vec![(61_000, "sessions:a".to_string())]);
    }

    #[test]
    fn test_iso_8601_base_field() {
        let store = Store::in_memory();
        let desc = descriptor();
        let record = Value::object([("created_at", Value::from("2024-06-01T12:00:00Z"))]);
        let mut txn = store.begin();
        apply(&mut txn, &desc, "sessions:iso", None, Some(&record)).unwrap();
        txn.commit().unwrap();

        let base_ms = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .timestamp_millis();
        let snap = store.snapshot();
        let expired = scan_expired(&store, &snap, &desc, base_ms + 60_000, 10).unwrap();
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn test_sweep_order_is_oldest_first() {
        let store = Store::in_memory();
        let desc = descriptor();
        let mut txn = store.begin();
        apply(&mut txn, &desc, "sessions:new", None, Some(&session(5_000))).unwrap();
        apply(&mut txn, &desc, "sessions:old", None, Some(&session(1_000))).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        let expired = scan_expired(&store, &snap, &desc, i64::MAX - 1000, 10).unwrap();
        let pks: Vec<_> = expired.iter().map(|(_, pk)| pk.as_str()).collect();
        assert_eq!(pks, vec!["sessions:old", "sessions:new"]);
    }

    #[test]
    fn test_missing_field_produces_no_entry() {
        let store = Store::in_memory();
        let desc = descriptor();
        let mut txn = store.begin();
        apply(
            &mut txn,
            &desc,
            "sessions:none",
            None,
            Some(&Value::object([("other", Value::Int(1))])),
        )
        .unwrap();
        txn.commit().unwrap();
        let snap = store.snapshot();
        assert!(scan_expired(&store, &snap, &desc, i64::MAX - 1000, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_bad_base_value_is_schema_violation() {
        let store = Store::in_memory();
        let desc = descriptor();
        let mut txn = store.begin();
        let bad = Value::object([("created_at", Value::from("not a date"))]);
        assert!(matches!(
            apply(&mut txn, &desc, "sessions:bad", None, Some(&bad)),
            Err(ThemisError::SchemaViolation { .. })
        ));
        let worse = Value::object([("created_at", Value::Bool(true))]);
        assert!(apply(&mut txn, &desc, "sessions:bad", None, Some(&worse)).is_err());
    }

    #[test]
    fn test_delete_retracts_entry() {
        let store = Store::in_memory();
        let desc = descriptor();
        let mut txn = store.begin();
        apply(&mut txn, &desc, "sessions:a", None, Some(&session(1_000))).unwrap();
        txn.commit().unwrap();
        let mut txn = store.begin();
        apply(&mut txn, &desc, "sessions:a", Some(&session(1_000)), None).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert!(scan_expired(&store, &snap, &desc, i64::MAX - 1000, 10)
            .unwrap()
            .is_empty());
    }
}
