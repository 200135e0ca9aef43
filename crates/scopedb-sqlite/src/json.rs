//! Conversion between JSON records and SQLite values
//!
//! A stored row is laid out as `key, index columns..., _default_`. Reading a
//! row back merges the index columns and the key into the decoded payload.
//! Index columns hold the coerced value, so a field that failed numeric
//! coercion reads back as absent, and a non-string value under a text index
//! reads back as its JSON text.

use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Number, Value};

use scopedb_core::schema::{ColumnValue, IndexSchema, StoreSchema};
use scopedb_core::Key;

use crate::error::{Result, SqliteError};

/// Largest integer an f64 represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// SQLite value for a key. Integral numbers bind as INTEGER.
pub fn key_to_sql(key: &Key) -> Result<SqlValue> {
    match key {
        Key::Number(n) if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER => Ok(SqlValue::Integer(*n as i64)),
        Key::Number(n) => Ok(SqlValue::Real(*n)),
        Key::Text(s) => Ok(SqlValue::Text(s.clone())),
        Key::Array(_) => Err(SqliteError::UnsupportedKey(key.to_string())),
    }
}

/// Read a key column back. `NULL` and blobs are not keys.
pub fn sql_to_key(value: SqlValue) -> Option<Key> {
    match value {
        SqlValue::Integer(i) => Some(Key::Number(i as f64)),
        SqlValue::Real(f) => Some(Key::Number(f)),
        SqlValue::Text(s) => Some(Key::Text(s)),
        SqlValue::Null | SqlValue::Blob(_) => None,
    }
}

/// SQLite value for a coerced index field. NaN is stored as `NULL`.
pub fn column_to_sql(value: &ColumnValue) -> SqlValue {
    match value {
        ColumnValue::Integer(i) => SqlValue::Integer(*i),
        ColumnValue::Float(f) if f.is_nan() => SqlValue::Null,
        ColumnValue::Float(f) => SqlValue::Real(*f),
        ColumnValue::Text(s) => SqlValue::Text(s.clone()),
        ColumnValue::NotANumber => SqlValue::Null,
    }
}

/// Bind parameter for raw SQL. Arrays and objects bind as JSON text.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
    }
}

/// Rebuild a record from a row laid out as `key, indexes..., _default_`.
pub fn row_to_record(store: &StoreSchema, indexes: &[&IndexSchema], row: Vec<SqlValue>) -> Result<Value> {
    let mut values = row.into_iter();
    let key = values.next().map(sql_to_json).unwrap_or(Value::Null);
    let columns: Vec<Value> = values.by_ref().take(indexes.len()).map(sql_to_json).collect();

    let mut record = match values.next() {
        Some(SqlValue::Text(payload)) => serde_json::from_str(&payload)?,
        _ => Value::Object(Map::new()),
    };
    let Value::Object(fields) = &mut record else {
        return Err(SqliteError::Invalid(format!(
            "payload of a '{}' row is not an object",
            store.name()
        )));
    };

    for (index, value) in indexes.iter().zip(columns) {
        if !value.is_null() {
            fields.insert(index.name.clone(), value);
        }
    }
    if !key.is_null() {
        store.assign_key(&mut record, key);
    }
    Ok(record)
}
