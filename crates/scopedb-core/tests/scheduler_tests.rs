//! Scheduling, joining and failure propagation through the storage facade

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use scopedb_core::schema::{DataType, DatabaseSchema, IndexSchema, StoreSchema};
use scopedb_core::storage::{Fault, MemoryBackend};
use scopedb_core::{
    CrudService, Key, KeyRange, Query, Storage, StorageConfig, StorageError, TerminalKind,
    TransactionMode,
};
use serde_json::{json, Value};

use TransactionMode::{ReadOnly, ReadWrite};

fn schema() -> DatabaseSchema {
    DatabaseSchema::new(1)
        .with_store(
            StoreSchema::new("users", "id")
                .with_index(IndexSchema::new("email").unique())
                .with_index(IndexSchema::new("age").typed(DataType::Integer)),
        )
        .with_store(StoreSchema::new("orders", "id"))
        .with_store(StoreSchema::new("audit", "seq").with_auto_increment())
}

async fn open_with(config: StorageConfig) -> Storage<MemoryBackend> {
    scopedb_core::tracing::init_with_filter("warn");
    Storage::open(config, schema(), MemoryBackend::new()).await.unwrap()
}

async fn open() -> Storage<MemoryBackend> {
    open_with(StorageConfig::new("test")).await
}

/// Helper to create a user record
fn user(id: &str) -> Value {
    json!({ "id": id })
}

fn ids(records: &[Value]) -> Vec<&str> {
    records.iter().filter_map(|r| r["id"].as_str()).collect()
}

#[tokio::test]
async fn test_same_scope_runs_in_program_order() {
    let storage = open().await;

    let first = storage.put("users", json!({"id": "u1", "n": 1}));
    let read_first = storage.get("users", "u1");
    let second = storage.put("users", json!({"id": "u1", "n": 2}));
    let read_second = storage.get("users", "u1");

    first.await.unwrap();
    assert_eq!(read_first.await.unwrap(), Some(json!({"id": "u1", "n": 1})));
    second.await.unwrap();
    assert_eq!(read_second.await.unwrap(), Some(json!({"id": "u1", "n": 2})));
}

#[tokio::test]
async fn test_disjoint_scopes_both_complete() {
    let storage = open().await;

    let (users, orders) = tokio::join!(
        storage.put("users", user("u1")),
        storage.put("orders", json!({"id": "o1", "user": "u1"}))
    );
    assert_eq!(users.unwrap(), Key::from("u1"));
    assert_eq!(orders.unwrap(), Key::from("o1"));
    assert_eq!(storage.backend().snapshot("orders").len(), 1);
}

#[tokio::test]
async fn test_join_inside_transaction_reuses_context() {
    let storage = Arc::new(open().await);
    let inner = storage.clone();

    let (tx, opened_inside) = storage
        .transaction("users", ReadWrite, move |session| async move {
            let before = inner.tx_no();
            let joined = inner.put("users", user("u1"));
            assert!(!joined.is_queued());
            joined.await?;
            assert_eq!(inner.get("users", "u1").await?, Some(user("u1")));
            Ok((session.sequence(), inner.tx_no() - before))
        })
        .await
        .unwrap();

    assert_eq!(opened_inside, 0);
    assert_eq!(storage.tx_no(), tx);
    assert_eq!(storage.backend().transactions_opened(), 1);
    assert_eq!(storage.backend().snapshot("users"), vec![user("u1")]);
}

#[tokio::test]
async fn test_session_join_validates_scope() {
    let storage = open().await;

    let results = storage
        .transaction(["users", "audit"], ReadWrite, |session| async move {
            let seq = session.join("users", ReadOnly, |s| s.sequence());
            let doubled = session.join_with("audit", ReadWrite, 21, |_, n| n * 2);
            let uncovered = session.join("orders", ReadOnly, |_| ());
            let unknown = session.join("ghost", ReadOnly, |_| ());
            Ok((session.sequence(), seq, doubled, uncovered, unknown))
        })
        .await
        .unwrap();

    let (tx, seq, doubled, uncovered, unknown) = results;
    assert_eq!(seq.unwrap(), tx);
    assert_eq!(doubled.unwrap(), 42);
    assert!(matches!(uncovered, Err(StorageError::Argument(_))));
    assert!(matches!(unknown, Err(StorageError::Argument(_))));
}

#[tokio::test]
async fn test_readonly_session_refuses_writes() {
    let storage = open().await;

    let result = storage
        .transaction("users", ReadOnly, |session| async move {
            session.put("users", user("u1")).await
        })
        .await;

    assert!(matches!(result, Err(StorageError::Argument(_))));
    assert!(storage.backend().snapshot("users").is_empty());
}

#[tokio::test]
async fn test_fatal_error_aborts_queued_requests() {
    let storage = open().await;
    storage.put("users", user("r1")).await.unwrap();

    storage.backend().inject(Fault::AbortExec, 0);
    let r2 = storage.put("users", user("r2"));
    let r3 = storage.put("users", user("r3"));

    for result in [r2.await, r3.await] {
        assert!(matches!(
            result,
            Err(StorageError::TransactionAborted { kind: TerminalKind::Abort, .. })
        ));
    }
    assert_eq!(storage.backend().snapshot("users"), vec![user("r1")]);
}

#[tokio::test]
async fn test_abort_before_queued_requests_run() {
    let storage = open().await;
    storage.put("users", user("r1")).await.unwrap();

    let aborter = storage.transaction("users", ReadWrite, |session| async move {
        session.abort("stop here").await;
        Ok(session.sequence())
    });
    let r2 = storage.put("users", user("r2"));
    let r3 = storage.count("users", Query::All);

    match aborter.await {
        Err(StorageError::TransactionAborted { kind, reason, .. }) => {
            assert_eq!(kind, TerminalKind::Abort);
            assert_eq!(reason, "stop here");
        }
        other => panic!("expected abort, got {other:?}"),
    }
    assert!(matches!(r2.await, Err(StorageError::TransactionAborted { .. })));
    assert!(matches!(r3.await, Err(StorageError::TransactionAborted { .. })));

    // earlier, independent transaction is untouched
    assert_eq!(storage.count("users", Query::All).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_store_fails_before_scheduling() {
    let storage = open().await;
    let before = storage.tx_no();

    let put = storage.put("ghost", user("x"));
    assert!(!put.is_queued());
    assert!(matches!(put.await, Err(StorageError::Argument(_))));

    let by_index = storage.list("users", Query::index("nickname", KeyRange::all()));
    assert!(matches!(by_index.await, Err(StorageError::Argument(_))));

    let missing_key = storage.put("users", json!({"name": "no id"}));
    assert!(matches!(missing_key.await, Err(StorageError::Argument(_))));

    assert_eq!(storage.tx_no(), before);
    assert_eq!(storage.backend().transactions_opened(), 0);
}

#[tokio::test]
async fn test_panicking_callback_is_isolated() {
    let storage = open().await;

    let bad = storage.transaction("users", ReadWrite, |session| async move {
        if session.sequence() > 0 {
            panic!("callback bug");
        }
        Ok(())
    });
    let good = storage.put("users", user("ok"));

    match bad.await {
        Err(StorageError::ListenerFault(message)) => assert_eq!(message, "callback bug"),
        other => panic!("expected listener fault, got {other:?}"),
    }
    assert_eq!(good.await.unwrap(), Key::from("ok"));
    assert_eq!(storage.backend().snapshot("users"), vec![user("ok")]);
}

#[tokio::test]
async fn test_completion_listener() {
    let storage = open().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    storage
        .transaction("users", ReadWrite, move |session| async move {
            session.set_completed_listener(move |kind, detail| {
                sink.lock().push((kind, detail.map(str::to_string)));
            });
            session.put("users", user("u1")).await
        })
        .await
        .unwrap();

    let sink = seen.clone();
    let aborted = storage
        .transaction("users", ReadWrite, move |session| async move {
            session.set_completed_listener(move |kind, detail| {
                sink.lock().push((kind, detail.map(str::to_string)));
            });
            session.abort("undo").await;
            Ok(())
        })
        .await;
    assert!(aborted.is_err());

    assert_eq!(
        *seen.lock(),
        vec![
            (TerminalKind::Complete, None),
            (TerminalKind::Abort, Some("undo".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_panicking_listener_is_swallowed() {
    let storage = open().await;

    let result = storage
        .transaction("users", ReadWrite, |session| async move {
            session.set_completed_listener(|_, _| panic!("listener bug"));
            session.put("users", user("u1")).await
        })
        .await;

    assert_eq!(result.unwrap(), Key::from("u1"));
    assert_eq!(storage.get("users", "u1").await.unwrap(), Some(user("u1")));
}

#[tokio::test]
async fn test_nested_start_runs_in_fresh_context() {
    let storage = open().await;

    let (outer, nested) = storage
        .transaction("users", ReadWrite, |session| async move {
            session.put("users", user("outer")).await?;
            let nested = session.start_nested("users", ReadOnly, |inner| async move {
                let seen = inner.get("users", "outer").await?;
                Ok((inner.sequence(), seen))
            });
            Ok((session.sequence(), nested))
        })
        .await
        .unwrap();

    let (inner, seen) = nested.await.unwrap();
    assert!(inner > outer);
    assert_eq!(seen, Some(user("outer")));
}

#[tokio::test]
async fn test_session_outliving_transaction_is_inactive() {
    let storage = open().await;

    let leaked = storage
        .transaction("users", ReadWrite, |session| async move { Ok(session.clone()) })
        .await
        .unwrap();

    assert!(!leaked.is_active());
    assert!(leaked.handle().is_none());
    let result = leaked.put("users", user("late")).await;
    assert!(matches!(result, Err(StorageError::TransactionInactive(_))));
}

#[tokio::test]
async fn test_request_local_error_keeps_context() {
    let storage = open().await;
    storage.put("users", json!({"id": "u1", "email": "a@x"})).await.unwrap();

    let duplicate = storage.add("users", user("u1"));
    let clash = storage.put("users", json!({"id": "u2", "email": "a@x"}));
    let fine = storage.put("users", user("u3"));

    assert!(matches!(duplicate.await, Err(StorageError::Constraint(_))));
    assert!(matches!(clash.await, Err(StorageError::Constraint(_))));
    assert_eq!(fine.await.unwrap(), Key::from("u3"));
    assert_eq!(ids(&storage.backend().snapshot("users")), vec!["u1", "u3"]);
}

#[tokio::test]
async fn test_failed_put_all_writes_nothing() {
    let storage = open().await;
    storage.put("users", json!({"id": "u1", "email": "a@x"})).await.unwrap();

    let batch = storage.put_all(
        "users",
        vec![json!({"id": "u2", "email": "b@x"}), json!({"id": "u3", "email": "a@x"})],
    );
    assert!(matches!(batch.await, Err(StorageError::Constraint(_))));
    assert_eq!(ids(&storage.backend().snapshot("users")), vec!["u1"]);
}

fn assert_all_aborted(errors: &[Option<StorageError>], reason_contains: &str) {
    assert!(!errors.is_empty());
    for err in errors {
        match err {
            Some(StorageError::TransactionAborted { reason, .. }) => assert!(reason.contains(reason_contains)),
            other => panic!("expected transaction aborted, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_calls_after_abort_in_callback_resolve_aborted() {
    let storage = Arc::new(open().await);
    let inner = storage.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    let result = storage
        .transaction("users", ReadWrite, move |session| async move {
            session.abort("stop").await;
            let through_facade = tokio::time::timeout(Duration::from_secs(2), inner.count("users", Query::All)).await;
            let through_session = session.count("users", Query::All).await;
            let joined = session.join("users", ReadOnly, |_| ());
            let mut guard = record.lock();
            match through_facade {
                Ok(result) => guard.push(result.err()),
                Err(_) => guard.push(Some(StorageError::Closed("facade call never resolved".into()))),
            }
            guard.push(through_session.err());
            guard.push(joined.err());
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(StorageError::TransactionAborted { .. })));
    assert_all_aborted(&seen.lock(), "stop");
    assert_eq!(storage.backend().transactions_opened(), 1);
}

#[tokio::test]
async fn test_fatal_exec_mid_callback_fails_later_joined_calls() {
    let storage = Arc::new(open().await);
    storage.backend().inject(Fault::AbortExec, 1);
    let inner = storage.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    let result = storage
        .transaction("users", ReadWrite, move |session| async move {
            session.put("users", user("u1")).await?;
            let failed = session.put("users", user("u2")).await;
            let through_session = session.get("users", "u1").await;
            let through_facade = tokio::time::timeout(Duration::from_secs(2), inner.put("users", user("u3"))).await;
            let mut guard = record.lock();
            guard.push(failed.err());
            guard.push(through_session.err());
            match through_facade {
                Ok(result) => guard.push(result.err()),
                Err(_) => guard.push(Some(StorageError::Closed("facade call never resolved".into()))),
            }
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(StorageError::TransactionAborted { .. })));
    assert_all_aborted(&seen.lock(), "injected abort");
    assert!(storage.backend().snapshot("users").is_empty());
}

#[tokio::test]
async fn test_explicit_key_writes() {
    let storage = open().await;

    let key = storage
        .add_with_key("users", json!({"email": "k@x"}), "k1")
        .await
        .unwrap();
    assert_eq!(key, Key::from("k1"));
    assert_eq!(
        storage.get("users", "k1").await.unwrap(),
        Some(json!({"id": "k1", "email": "k@x"}))
    );

    // an explicit key overrides the one inside the record
    storage
        .put_with_key("users", json!({"id": "ignored", "n": 2}), "k1")
        .await
        .unwrap();
    assert_eq!(ids(&storage.backend().snapshot("users")), vec!["k1"]);

    let seq = storage
        .add_with_key("audit", json!({"event": "import"}), 7i64)
        .await
        .unwrap();
    let next = storage.add("audit", json!({"event": "next"})).await.unwrap();
    assert_eq!((seq, next), (Key::from(7i64), Key::from(8i64)));

    let scalar = storage.put_with_key("users", json!("scalar"), "k2");
    assert!(matches!(scalar.await, Err(StorageError::Argument(_))));
}

#[tokio::test]
async fn test_commit_failure_reports_error() {
    let storage = open().await;
    storage.backend().inject(Fault::FailCommit, 0);

    let result = storage.put("users", user("u1")).await;
    assert!(matches!(
        result,
        Err(StorageError::TransactionAborted { kind: TerminalKind::Error, .. })
    ));
    assert!(storage.backend().snapshot("users").is_empty());
}

#[tokio::test]
async fn test_refused_open_rejects_batch() {
    let storage = open().await;
    storage.backend().inject(Fault::RefuseOpen, 0);

    let first = storage.put("users", user("u1"));
    let second = storage.put("users", user("u2"));
    assert!(first.await.is_err());
    assert!(second.await.is_err());

    storage.put("users", user("u3")).await.unwrap();
    assert_eq!(ids(&storage.backend().snapshot("users")), vec!["u3"]);
}

#[tokio::test]
async fn test_compatible_requests_share_a_transaction() {
    let storage = open().await;

    let writes: Vec<_> = ["a", "b", "c"].iter().map(|id| storage.put("users", user(id))).collect();
    for write in writes {
        write.await.unwrap();
    }
    assert_eq!(storage.tx_no(), 1);

    // a readonly head never carries writes
    let read = storage.count("users", Query::All);
    let write = storage.put("users", user("d"));
    assert_eq!(read.await.unwrap(), 3);
    write.await.unwrap();
    assert_eq!(storage.tx_no(), 3);
}

#[tokio::test]
async fn test_coalescing_can_be_disabled() {
    let storage = open_with(StorageConfig::new("solo").with_coalesce(false)).await;

    let writes: Vec<_> = ["a", "b", "c"].iter().map(|id| storage.put("users", user(id))).collect();
    for write in writes {
        write.await.unwrap();
    }
    assert_eq!(storage.tx_no(), 3);
}

#[tokio::test]
async fn test_named_queues_share_connection() {
    let storage = open().await;
    let side = storage.new_queue("side");
    assert_eq!(side.name(), "side");

    let (a, b) = tokio::join!(
        storage.put("users", user("u1")),
        side.put("orders", json!({"id": "o1"}))
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(storage.tx_no(), 2);
    assert_eq!(side.tx_no(), 2);
    assert_eq!(storage.to_string(), "Storage:test:2");
}

#[tokio::test]
async fn test_close_finishes_queued_requests() {
    let storage = open().await;

    let pending = storage.put("users", user("p"));
    storage.close();

    assert!(matches!(
        storage.put("users", user("late")).await,
        Err(StorageError::Closed(_))
    ));
    assert_eq!(pending.await.unwrap(), Key::from("p"));

    storage.shutdown().await;
    assert!(storage.queue().is_closed());
    assert_eq!(storage.backend().snapshot("users"), vec![user("p")]);
}

#[tokio::test]
async fn test_rollback_discards_transaction_writes() {
    let storage = open().await;

    let result = storage
        .transaction(["users", "audit"], ReadWrite, |session| async move {
            session.put("users", user("u1")).await?;
            session.add("audit", json!({"event": "created"})).await?;
            session.abort("changed my mind").await;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(StorageError::TransactionAborted { .. })));
    assert!(storage.backend().snapshot("users").is_empty());
    assert!(storage.backend().snapshot("audit").is_empty());
}

#[tokio::test]
async fn test_crud_surface() {
    let storage = open().await;

    let keys = storage
        .add_all(
            "users",
            vec![
                json!({"id": "a", "age": 30}),
                json!({"id": "b", "age": "41"}),
                json!({"id": "c", "age": 25}),
            ],
        )
        .await
        .unwrap();
    assert_eq!(keys, vec![Key::from("a"), Key::from("b"), Key::from("c")]);

    let audit = storage.add("audit", json!({"event": "import"})).await.unwrap();
    assert_eq!(audit, Key::from(1i64));
    assert_eq!(
        storage.backend().snapshot("audit"),
        vec![json!({"event": "import", "seq": 1})]
    );

    let older = storage
        .keys("users", Query::index("age", KeyRange::lower_bound(30i64, false)))
        .await
        .unwrap();
    assert_eq!(older, vec![Key::from("a"), Key::from("b")]);

    let range = storage.count("users", KeyRange::bound("a", "b")).await.unwrap();
    assert_eq!(range, 2);

    let removed = storage.clear("users", "c").await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(ids(&storage.list("users", Query::All).await.unwrap()), vec!["a", "b"]);

    let cleared = storage.clear_all(["users", "audit"]).await.unwrap();
    assert_eq!(cleared, 3);
    assert_eq!(storage.count("users", Query::All).await.unwrap(), 0);
}

#[tokio::test]
async fn test_load_delimited_text() {
    let storage = open().await;

    let keys = storage
        .load("users", "id,age,email\nu1,30,a@x\nu2,41,b@x\n", ',')
        .await
        .unwrap();
    assert_eq!(keys, vec![Key::from("u1"), Key::from("u2")]);

    let found = storage
        .list("users", Query::index("age", KeyRange::lower_bound(35i64, false)))
        .await
        .unwrap();
    assert_eq!(found, vec![json!({"id": "u2", "age": 41, "email": "b@x"})]);
}

#[tokio::test]
async fn test_sql_needs_capability() {
    let storage = open().await;
    let result = storage.execute_sql("users", "SELECT * FROM users", vec![]).await;
    assert!(matches!(result, Err(StorageError::NotSupported(_))));
}
