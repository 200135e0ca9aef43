//! SQLite storage backend implementing the scopedb Backend trait

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use scopedb_core::schema::{quote_identifier, DatabaseSchema, StoreSchema, OPAQUE_COLUMN};
use scopedb_core::storage::{Backend, BackendError, BackendResult, Capabilities, Operation, Outcome};
use scopedb_core::tx::{Scope, TerminalEvent, TransactionMode};
use scopedb_core::{Key, Query};

use crate::error::{Result, SqliteError};
use crate::json::{column_to_sql, json_to_sql, key_to_sql, row_to_record, sql_to_json, sql_to_key};
use crate::migrate::{index_columns, migrate};
use crate::sql::{record_columns, Selection};

/// Open transaction on a [`SqliteBackend`].
#[derive(Debug)]
pub struct SqliteTx {
    id: u64,
    scope: Scope,
    mode: TransactionMode,
    finished: AtomicBool,
}

impl SqliteTx {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// SQLite-backed storage on a single connection.
///
/// Each store is a table; see [`crate::migrate`] for the layout. Host
/// transactions map to `BEGIN`/`COMMIT`, and a read-write transaction takes
/// the write lock up front with `BEGIN IMMEDIATE`.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    schema: RwLock<Option<Arc<DatabaseSchema>>>,
    opened: AtomicU64,
}

impl SqliteBackend {
    /// Create a backend from a connection. Tables are created when the
    /// storage facade opens.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            schema: RwLock::new(None),
            opened: AtomicU64::new(0),
        }
    }

    /// Create a new in-memory SQLite backend (for testing)
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?))
    }

    /// Create a new file-backed SQLite backend
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Connection::open(path)?))
    }

    /// Run `f` against the underlying connection. Must not be called while
    /// a transaction is open on another task.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&self.conn.lock())
    }

    /// Number of host transactions opened so far.
    pub fn transactions_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    fn store_schema(&self, name: &str) -> Result<StoreSchema> {
        self.schema
            .read()
            .as_ref()
            .and_then(|schema| schema.store(name).cloned())
            .ok_or_else(|| SqliteError::Invalid(format!("unknown store '{name}'")))
    }

    fn run(&self, conn: &Connection, tx: &SqliteTx, op: Operation) -> Result<Outcome> {
        if let Operation::Sql { sql, params } = op {
            return run_sql(conn, tx, &sql, &params).map(Outcome::Records);
        }

        let name = op.store().unwrap_or_default().to_string();
        if !tx.scope.contains(&name) {
            return Err(SqliteError::Invalid(format!("store '{name}' is not in transaction scope")));
        }
        if op.is_write() && !tx.mode.is_write() {
            return Err(SqliteError::Invalid(format!("{} in a readonly transaction", op.name())));
        }
        let store = self.store_schema(&name)?;

        match op {
            Operation::Add { records, .. } => write(conn, &store, records, false).map(Outcome::Keys),
            Operation::Put { records, .. } => write(conn, &store, records, true).map(Outcome::Keys),
            Operation::Get { query, .. } => {
                let record = select_records(conn, &store, &query)?.into_iter().next();
                Ok(Outcome::Record(record))
            }
            Operation::Count { query, .. } => {
                let selection = Selection::new(&store, &query)?;
                let sql = format!("SELECT COUNT(*) FROM ({})", selection.select("1"));
                let count: i64 = conn.query_row(&sql, params_from_iter(selection.params()), |row| row.get(0))?;
                Ok(Outcome::Count(count.max(0) as u64))
            }
            Operation::Keys { query, .. } => select_keys(conn, &store, &query).map(Outcome::Keys),
            Operation::List { query, .. } => select_records(conn, &store, &query).map(Outcome::Records),
            Operation::Clear { query, .. } => {
                let removed = match query {
                    Query::All => conn.execute(&format!("DELETE FROM {}", store.quoted_name()), [])?,
                    query => {
                        let selection = Selection::new(&store, &query)?;
                        let key = store.quoted_key_path();
                        let sql = format!(
                            "DELETE FROM {} WHERE {key} IN ({})",
                            store.quoted_name(),
                            selection.select(&key)
                        );
                        conn.execute(&sql, params_from_iter(selection.params()))?
                    }
                };
                Ok(Outcome::Count(removed as u64))
            }
            Operation::Sql { .. } => unreachable!("raw SQL handled above"),
        }
    }

    fn finish(&self, tx: &SqliteTx, statement: &str) -> std::result::Result<(), String> {
        if tx.finished.swap(true, Ordering::SeqCst) {
            return Err(format!("transaction {} already finished", tx.id));
        }
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            return Err(format!("transaction {} was rolled back by SQLite", tx.id));
        }
        conn.execute_batch(statement).map_err(|err| {
            if !conn.is_autocommit() {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    warn!("rollback of transaction {} failed: {}", tx.id, rollback);
                }
            }
            err.to_string()
        })
    }
}

impl Backend for SqliteBackend {
    type Handle = SqliteTx;

    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { cursor: true, sql: true }
    }

    async fn prepare(&self, schema: Arc<DatabaseSchema>) -> BackendResult<()> {
        migrate(&self.conn.lock(), &schema)?;
        *self.schema.write() = Some(schema);
        Ok(())
    }

    async fn open(&self, scope: &Scope, mode: TransactionMode) -> BackendResult<SqliteTx> {
        let begin = if mode.is_write() {
            "BEGIN IMMEDIATE"
        } else {
            "BEGIN DEFERRED"
        };
        self.conn
            .lock()
            .execute_batch(begin)
            .map_err(|err| BackendError::Transaction(err.to_string()))?;

        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("sqlite transaction {} opened on {} ({})", id, scope, mode);
        Ok(SqliteTx {
            id,
            scope: scope.clone(),
            mode,
            finished: AtomicBool::new(false),
        })
    }

    async fn exec(&self, tx: &SqliteTx, op: Operation) -> BackendResult<Outcome> {
        if tx.finished.load(Ordering::SeqCst) {
            return Err(BackendError::Transaction(format!("transaction {} finished", tx.id)));
        }
        let conn = self.conn.lock();
        match self.run(&conn, tx, op) {
            Ok(outcome) => Ok(outcome),
            // SQLite rolls back on its own after some failures (full disk, I/O)
            Err(err) if conn.is_autocommit() => {
                tx.finished.store(true, Ordering::SeqCst);
                Err(BackendError::Aborted(err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn commit(&self, tx: &SqliteTx) -> TerminalEvent {
        match self.finish(tx, "COMMIT") {
            Ok(()) => TerminalEvent::complete(),
            Err(reason) => TerminalEvent::error(reason),
        }
    }

    async fn abort(&self, tx: &SqliteTx, reason: &str) -> TerminalEvent {
        if let Err(err) = self.finish(tx, "ROLLBACK") {
            debug!("rollback of transaction {}: {}", tx.id, err);
        }
        TerminalEvent::abort(reason)
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("opened", &self.transactions_opened())
            .finish_non_exhaustive()
    }
}

/// Write every record or none of them, using a savepoint inside the open
/// transaction.
fn write(conn: &Connection, store: &StoreSchema, records: Vec<Value>, replace: bool) -> Result<Vec<Key>> {
    conn.execute_batch("SAVEPOINT scopedb_write")?;
    match write_records(conn, store, records, replace) {
        Ok(keys) => {
            conn.execute_batch("RELEASE scopedb_write")?;
            Ok(keys)
        }
        Err(err) => {
            // fails only if sqlite already rolled the whole transaction back
            if let Err(rollback) = conn.execute_batch("ROLLBACK TO scopedb_write; RELEASE scopedb_write") {
                debug!("savepoint rollback failed: {}", rollback);
            }
            Err(err)
        }
    }
}

fn write_records(conn: &Connection, store: &StoreSchema, records: Vec<Value>, replace: bool) -> Result<Vec<Key>> {
    let indexes = index_columns(store);
    let mut keys = Vec::with_capacity(records.len());

    for record in records {
        let projected = store.project_indexed_values(&record);
        let key = match &projected.key {
            Some(value) => Some(
                Key::from_value(value)
                    .ok_or_else(|| SqliteError::Invalid(format!("invalid key {value} at '{}'", store.key_path())))?,
            ),
            None if store.is_auto_increment() => None,
            None => {
                return Err(SqliteError::Invalid(format!(
                    "record has no key at '{}'",
                    store.key_path()
                )))
            }
        };

        let mut names = Vec::with_capacity(indexes.len() + 2);
        let mut values = Vec::with_capacity(indexes.len() + 2);
        if let Some(key) = &key {
            names.push(store.quoted_key_path());
            values.push(key_to_sql(key)?);
        }
        for index in &indexes {
            names.push(quote_identifier(&index.name));
            values.push(projected.column(&index.name).map(column_to_sql).unwrap_or(SqlValue::Null));
        }
        names.push(quote_identifier(OPAQUE_COLUMN));
        values.push(SqlValue::Text(projected.payload));

        let placeholders = vec!["?"; values.len()].join(", ");
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            store.quoted_name(),
            names.join(", ")
        );
        if replace && key.is_some() {
            let updates: Vec<String> = names[1..]
                .iter()
                .map(|name| format!("{name} = excluded.{name}"))
                .collect();
            sql.push_str(&format!(
                " ON CONFLICT({}) DO UPDATE SET {}",
                store.quoted_key_path(),
                updates.join(", ")
            ));
        }
        conn.execute(&sql, params_from_iter(values.iter()))?;

        keys.push(key.unwrap_or_else(|| Key::Number(conn.last_insert_rowid() as f64)));
    }
    Ok(keys)
}

fn select_records(conn: &Connection, store: &StoreSchema, query: &Query) -> Result<Vec<Value>> {
    let selection = Selection::new(store, query)?;
    let indexes = index_columns(store);
    let width = indexes.len() + 2;

    let mut stmt = conn.prepare(&selection.select(&record_columns(store)))?;
    let rows = stmt
        .query_map(params_from_iter(selection.params()), |row| {
            (0..width).map(|i| row.get::<_, SqlValue>(i)).collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|row| row_to_record(store, &indexes, row))
        .collect()
}

fn select_keys(conn: &Connection, store: &StoreSchema, query: &Query) -> Result<Vec<Key>> {
    let selection = Selection::new(store, query)?;
    let mut stmt = conn.prepare(&selection.select(&store.quoted_key_path()))?;
    let keys = stmt
        .query_map(params_from_iter(selection.params()), |row| row.get::<_, SqlValue>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys.into_iter().filter_map(sql_to_key).collect())
}

/// Statements a readonly transaction may run.
fn is_query(sql: &str) -> bool {
    let head = sql.trim_start();
    ["select", "with", "explain"].iter().any(|keyword| {
        head.get(..keyword.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword))
    })
}

/// Run raw SQL. Statements returning rows yield one JSON object per row;
/// others yield `[{"changes": n}]`.
fn run_sql(conn: &Connection, tx: &SqliteTx, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
    if !tx.mode.is_write() && !is_query(sql) {
        return Err(SqliteError::Invalid("statement modifies data in a readonly transaction".into()));
    }
    let params: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
    let mut stmt = conn.prepare(sql)?;

    if stmt.column_count() == 0 {
        let changes = stmt.execute(params_from_iter(params.iter()))?;
        return Ok(vec![json!({ "changes": changes })]);
    }

    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            (0..names.len())
                .map(|i| row.get::<_, SqlValue>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let fields: Map<String, Value> = names.iter().cloned().zip(row.into_iter().map(sql_to_json)).collect();
            Value::Object(fields)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_query() {
        assert!(is_query("  SELECT * FROM users"));
        assert!(is_query("with t as (select 1) select * from t"));
        assert!(!is_query("DELETE FROM users"));
        assert!(!is_query("sel"));
    }
}
