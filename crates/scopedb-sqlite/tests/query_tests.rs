//! Query, cursor and raw SQL tests for SqliteBackend

use pretty_assertions::assert_eq;
use scopedb_core::schema::{DataType, DatabaseSchema, IndexSchema, StoreSchema};
use scopedb_core::{CrudService, Cursor, Key, KeyRange, Query, Storage, StorageConfig};
use serde_json::{json, Value};

use scopedb_sqlite::SqliteBackend;

fn schema() -> DatabaseSchema {
    DatabaseSchema::new(1)
        .with_store(
            StoreSchema::new("users", "id")
                .with_index(IndexSchema::new("city"))
                .with_index(IndexSchema::new("age").typed(DataType::Integer)),
        )
        .with_store(StoreSchema::new("things", "key"))
}

/// Helper to create a user record
fn create_user(id: &str, city: &str, age: i64) -> Value {
    json!({ "id": id, "city": city, "age": age })
}

async fn seeded() -> Storage<SqliteBackend> {
    let backend = SqliteBackend::in_memory().unwrap();
    let storage = Storage::open(StorageConfig::new("query"), schema(), backend)
        .await
        .unwrap();
    storage
        .put_all(
            "users",
            vec![
                create_user("alice", "Oslo", 34),
                create_user("bob", "Bergen", 27),
                create_user("carol", "Oslo", 45),
                create_user("dave", "Tromsø", 19),
                create_user("erin", "Bergen", 34),
            ],
        )
        .await
        .unwrap();
    storage
}

fn ids(records: &[Value]) -> Vec<&str> {
    records.iter().filter_map(|r| r["id"].as_str()).collect()
}

#[tokio::test]
async fn test_keys_in_primary_order() {
    let storage = seeded().await;

    let keys = storage.keys("users", Query::All).await.unwrap();
    let expected: Vec<Key> = ["alice", "bob", "carol", "dave", "erin"]
        .into_iter()
        .map(Key::from)
        .collect();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn test_key_range() {
    let storage = seeded().await;

    let records = storage
        .list("users", KeyRange::bound("b", "d").open_upper())
        .await
        .unwrap();
    assert_eq!(ids(&records), vec!["bob", "carol"]);
    assert_eq!(storage.count("users", KeyRange::lower_bound("c", false)).await.unwrap(), 3);
}

#[tokio::test]
async fn test_index_range_orders_by_index_then_key() {
    let storage = seeded().await;

    let records = storage
        .list("users", Query::index("age", KeyRange::bound(20i64, 40i64)))
        .await
        .unwrap();
    assert_eq!(ids(&records), vec!["bob", "alice", "erin"]);

    let oslo = storage
        .keys("users", Query::index("city", KeyRange::only("Oslo")))
        .await
        .unwrap();
    assert_eq!(oslo, vec![Key::from("alice"), Key::from("carol")]);
}

#[tokio::test]
async fn test_reverse_cursor_with_window() {
    let storage = seeded().await;

    let cursor = Cursor::new().on_index("age").reverse().offset(1).limit(2);
    let records = storage.list("users", cursor).await.unwrap();
    // ages descending: carol 45, erin 34, alice 34, bob 27, dave 19
    assert_eq!(ids(&records), vec!["erin", "alice"]);

    let cursor = Cursor::new().offset(3);
    assert_eq!(storage.count("users", cursor).await.unwrap(), 2);
}

#[tokio::test]
async fn test_get_first_of_range() {
    let storage = seeded().await;

    let youngest = storage
        .get("users", Query::index("age", KeyRange::all()))
        .await
        .unwrap();
    assert_eq!(youngest, Some(create_user("dave", "Tromsø", 19)));
}

#[tokio::test]
async fn test_clear_by_index() {
    let storage = seeded().await;

    let removed = storage
        .clear("users", Query::index("city", KeyRange::only("Bergen")))
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let records = storage.list("users", Query::All).await.unwrap();
    assert_eq!(ids(&records), vec!["alice", "carol", "dave"]);
}

#[tokio::test]
async fn test_numbers_sort_before_text() {
    let storage = seeded().await;
    storage
        .put_all(
            "things",
            vec![
                json!({"key": "a"}),
                json!({"key": 10}),
                json!({"key": 2}),
                json!({"key": 2.5}),
            ],
        )
        .await
        .unwrap();

    let keys = storage.keys("things", Query::All).await.unwrap();
    assert_eq!(
        keys,
        vec![Key::from(2i64), Key::from(2.5), Key::from(10i64), Key::from("a")]
    );
}

#[tokio::test]
async fn test_unparseable_index_value_is_not_indexed() {
    let storage = seeded().await;
    storage
        .put("users", json!({"id": "frank", "city": "Oslo", "age": "unknown"}))
        .await
        .unwrap();

    let aged = storage
        .count("users", Query::index("age", KeyRange::all()))
        .await
        .unwrap();
    assert_eq!(aged, 5);

    let frank = storage.get("users", "frank").await.unwrap();
    assert_eq!(frank, Some(json!({"id": "frank", "city": "Oslo"})));
}

#[tokio::test]
async fn test_execute_sql_select() {
    let storage = seeded().await;

    let rows = storage
        .execute_sql(
            "users",
            "SELECT id, age FROM users WHERE city = ? ORDER BY age DESC",
            vec![json!("Oslo")],
        )
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![json!({"id": "carol", "age": 45}), json!({"id": "alice", "age": 34})]
    );
}

#[tokio::test]
async fn test_execute_sql_write() {
    let storage = seeded().await;

    let result = storage
        .execute_sql("users", "UPDATE users SET age = age + 1 WHERE city = ?", vec![json!("Bergen")])
        .await
        .unwrap();
    assert_eq!(result, vec![json!({"changes": 2})]);

    let bob = storage.get("users", "bob").await.unwrap();
    assert_eq!(bob, Some(create_user("bob", "Bergen", 28)));
}
