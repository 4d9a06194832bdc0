//! Cross-layer integration tests: transactional invariants, index
//! atomicity, persistence, and checkpoints.

use std::sync::Arc;
use std::thread;
use themis::{
    Collation, DurabilityMode, Edge, IndexConfig, Options, Themis, ThemisError, Value,
};

fn user(name: &str, age: i64) -> Value {
    Value::object([("name", Value::from(name)), ("age", Value::Int(age))])
}

#[test]
fn record_round_trip_and_versioning() {
    let db = Themis::in_memory().unwrap();
    db.put("users", "1", user("alice", 30)).unwrap();
    assert_eq!(db.get("users", "1").unwrap(), Some(user("alice", 30)));

    let record = db.get_record("users", "1").unwrap().unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.hash, user("alice", 30).content_hash());

    db.put("users", "1", user("alice", 31)).unwrap();
    let record = db.get_record("users", "1").unwrap().unwrap();
    assert_eq!(record.version, 2);

    db.delete("users", "1").unwrap();
    assert_eq!(db.get("users", "1").unwrap(), None);
}

#[test]
fn replay_sequence_matches_last_writes() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut expected: std::collections::HashMap<String, Option<Value>> =
        std::collections::HashMap::new();
    {
        let db = Themis::open(
            dir.path(),
            Options {
                store: themis::StoreOptions {
                    durability: DurabilityMode::Strict,
                    ..themis::StoreOptions::default()
                },
                ..Options::default()
            },
        )
        .unwrap();
        for round in 0..120i64 {
            let key = format!("k{}", round % 17);
            if round % 6 == 5 {
                db.delete("mixed", &key).unwrap();
                expected.insert(key, None);
            } else {
                let value = user("u", round);
                db.put("mixed", &key, value.clone()).unwrap();
                expected.insert(key, Some(value));
            }
        }
        // Dropping without close(): the WAL is the only durable state.
    }
    let db = Themis::open(dir.path(), Options::default()).unwrap();
    for (key, value) in expected {
        assert_eq!(db.get("mixed", &key).unwrap(), value, "key {}", key);
    }
}

#[test]
fn conflict_detection_first_committer_wins() {
    let db = Themis::in_memory().unwrap();
    db.put("users", "42", user("base", 1)).unwrap();

    let mut t1 = db.begin();
    let mut t2 = db.begin();
    t1.put("users", "42", user("from-t1", 2)).unwrap();
    // T2 cannot acquire the write lock T1 holds.
    let err = t2.put("users", "42", user("from-t2", 2)).unwrap_err();
    assert!(
        matches!(
            err,
            ThemisError::Conflict { .. } | ThemisError::LockTimeout { .. }
        ),
        "unexpected error: {err}"
    );
    t1.commit().unwrap();
    t2.abort();

    assert_eq!(db.get("users", "42").unwrap(), Some(user("from-t1", 2)));
}

#[test]
fn concurrent_writers_exactly_one_per_key() {
    let db = Themis::in_memory().unwrap();
    let barrier = Arc::new(std::sync::Barrier::new(4));
    let mut handles = Vec::new();
    for worker in 0..4i64 {
        let db = db.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            db.put("hot", "key", user("w", worker)).is_ok()
        }));
    }
    let successes: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();
    // Auto-commit retries are the caller's business; at least one write
    // must land and the record must exist.
    assert!(successes >= 1);
    assert!(db.get("hot", "key").unwrap().is_some());
}

#[test]
fn index_atomicity_on_rollback() {
    let db = Themis::in_memory().unwrap();
    db.create_index(
        "users_age",
        "users",
        vec!["age".into()],
        IndexConfig::Equality { unique: false },
    )
    .unwrap();
    db.create_index(
        "users_age_r",
        "users",
        vec!["age".into()],
        IndexConfig::Range {
            collation: Collation::Binary,
        },
    )
    .unwrap();
    db.put("users", "7", user("a", 20)).unwrap();

    // Update inside a transaction, then abort.
    let mut txn = db.begin();
    txn.put("users", "7", user("a", 25)).unwrap();
    txn.abort();

    // Both indexes still map age=20 to users:7 and know nothing of 25.
    let hits = themis_executor::execute_aql(
        &db,
        "FOR u IN users FILTER u.age == 20 RETURN u.name",
        Default::default(),
        themis::QueryOptions::new(),
    )
    .unwrap();
    assert_eq!(hits.rows.len(), 1);
    let hits = themis_executor::execute_aql(
        &db,
        "FOR u IN users FILTER u.age == 25 RETURN u.name",
        Default::default(),
        themis::QueryOptions::new(),
    )
    .unwrap();
    assert!(hits.rows.is_empty());
}

#[test]
fn abort_leaves_store_unchanged_across_layers() {
    let db = Themis::in_memory().unwrap();
    db.create_index(
        "users_age",
        "users",
        vec!["age".into()],
        IndexConfig::Equality { unique: false },
    )
    .unwrap();
    db.put("users", "1", user("a", 20)).unwrap();
    let before = db.get_record("users", "1").unwrap();

    let mut txn = db.begin();
    txn.put("users", "1", user("b", 99)).unwrap();
    txn.put("users", "2", user("c", 50)).unwrap();
    txn.delete("users", "1").unwrap();
    txn.add_edge(Edge::new("g", "users:1", "users:2", "knows"))
        .unwrap();
    txn.abort();

    assert_eq!(db.get_record("users", "1").unwrap(), before);
    assert_eq!(db.get("users", "2").unwrap(), None);
    let spec = themis::TraversalSpec::bfs("g", "users:1", 1, 1, themis::TraverseDirection::Outbound);
    assert!(db.traverse(&spec).unwrap().entries.is_empty());
}

#[test]
fn unique_index_blocks_second_writer() {
    let db = Themis::in_memory().unwrap();
    db.create_index(
        "users_email",
        "users",
        vec!["email".into()],
        IndexConfig::Equality { unique: true },
    )
    .unwrap();
    db.put(
        "users",
        "1",
        Value::object([("email", Value::from("a@example.com"))]),
    )
    .unwrap();
    let err = db
        .put(
            "users",
            "2",
            Value::object([("email", Value::from("a@example.com"))]),
        )
        .unwrap_err();
    assert!(matches!(err, ThemisError::SchemaViolation { .. }));
    // The failed transaction left nothing behind.
    assert_eq!(db.get("users", "2").unwrap(), None);
}

#[test]
fn edge_mirror_bijection() {
    let db = Themis::in_memory().unwrap();
    let edge = Edge::new("social", "users:a", "users:b", "follows");
    let edge_id = edge.id.clone();
    db.add_edge(edge).unwrap();

    let out = db
        .traverse(&themis::TraversalSpec::bfs(
            "social",
            "users:a",
            1,
            1,
            themis::TraverseDirection::Outbound,
        ))
        .unwrap();
    let inbound = db
        .traverse(&themis::TraversalSpec::bfs(
            "social",
            "users:b",
            1,
            1,
            themis::TraverseDirection::Inbound,
        ))
        .unwrap();
    assert_eq!(out.entries.len(), 1);
    assert_eq!(inbound.entries.len(), 1);
    assert_eq!(out.entries[0].edge.as_ref().unwrap().id, edge_id);

    db.remove_edge("social", &edge_id).unwrap();
    let out = db
        .traverse(&themis::TraversalSpec::bfs(
            "social",
            "users:a",
            1,
            1,
            themis::TraverseDirection::Outbound,
        ))
        .unwrap();
    assert!(out.entries.is_empty());
}

#[test]
fn checkpoint_restore_round_trip() {
    let data = tempfile::TempDir::new().unwrap();
    let ckpt = tempfile::TempDir::new().unwrap();
    let restored = tempfile::TempDir::new().unwrap();

    {
        let db = Themis::open(data.path(), Options::default()).unwrap();
        db.create_index(
            "users_age",
            "users",
            vec!["age".into()],
            IndexConfig::Equality { unique: false },
        )
        .unwrap();
        db.put("users", "1", user("kept", 30)).unwrap();
        db.checkpoint(ckpt.path().join("cp")).unwrap();
        db.put("users", "2", user("after-checkpoint", 40)).unwrap();
        db.close().unwrap();
    }

    Themis::restore_from_checkpoint(ckpt.path().join("cp"), restored.path().join("data")).unwrap();
    let db = Themis::open(restored.path().join("data"), Options::default()).unwrap();
    assert_eq!(db.get("users", "1").unwrap(), Some(user("kept", 30)));
    assert_eq!(db.get("users", "2").unwrap(), None);

    // Indexes came along through the catalog and entries.
    let hits = themis_executor::execute_aql(
        &db,
        "FOR u IN users FILTER u.age == 30 RETURN u.name",
        Default::default(),
        themis::QueryOptions::new(),
    )
    .unwrap();
    assert_eq!(hits.rows, vec![Value::from("kept")]);
}

#[test]
fn ttl_sweep_removes_expired_records_everywhere() {
    let db = Themis::in_memory().unwrap();
    db.create_index(
        "sessions_ttl",
        "sessions",
        vec!["created".into()],
        IndexConfig::Ttl {
            field: "created".into(),
            ttl_seconds: 60,
        },
    )
    .unwrap();
    db.create_index(
        "sessions_user",
        "sessions",
        vec!["user".into()],
        IndexConfig::Equality { unique: false },
    )
    .unwrap();
    db.put(
        "sessions",
        "old",
        Value::object([("created", Value::Int(0)), ("user", Value::from("a"))]),
    )
    .unwrap();
    db.put(
        "sessions",
        "new",
        Value::object([
            ("created", Value::Int(10_000_000)),
            ("user", Value::from("a")),
        ]),
    )
    .unwrap();

    let deleted = db.sweep_expired(60_000).unwrap();
    assert_eq!(deleted, 1);
    assert!(db.get("sessions", "old").unwrap().is_none());
    assert!(db.get("sessions", "new").unwrap().is_some());

    // The equality index was retracted with the record.
    let hits = themis_executor::execute_aql(
        &db,
        "FOR s IN sessions FILTER s.user == 'a' RETURN s",
        Default::default(),
        themis::QueryOptions::new(),
    )
    .unwrap();
    assert_eq!(hits.rows.len(), 1);
}

#[test]
fn transaction_closure_commits_and_aborts() {
    let db = Themis::in_memory().unwrap();
    db.transaction(|txn| {
        txn.put("users", "1", user("a", 1))?;
        txn.put("users", "2", user("b", 2))?;
        Ok(())
    })
    .unwrap();
    assert!(db.get("users", "1").unwrap().is_some());
    assert!(db.get("users", "2").unwrap().is_some());

    let result: themis::Result<()> = db.transaction(|txn| {
        txn.put("users", "3", user("c", 3))?;
        Err(ThemisError::internal("forced failure"))
    });
    assert!(result.is_err());
    assert!(db.get("users", "3").unwrap().is_none());
}
