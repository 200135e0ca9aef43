//! Backend driver trait and the operations it executes

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use crate::query::Query;
use crate::schema::DatabaseSchema;
use crate::storage::error::BackendResult;
use crate::tx::{Scope, TerminalEvent, TransactionMode};

/// Optional features a backend offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Cursor queries with offset, limit and direction
    pub cursor: bool,
    /// Raw SQL execution
    pub sql: bool,
}

/// One unit of work executed against an open host transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Insert records; fails on an existing key
    Add { store: String, records: Vec<Value> },
    /// Insert or replace records
    Put { store: String, records: Vec<Value> },
    Get { store: String, query: Query },
    Count { store: String, query: Query },
    Keys { store: String, query: Query },
    List { store: String, query: Query },
    /// Delete matching records, yielding the number removed
    Clear { store: String, query: Query },
    Sql { sql: String, params: Vec<Value> },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Add { .. } => "add",
            Operation::Put { .. } => "put",
            Operation::Get { .. } => "get",
            Operation::Count { .. } => "count",
            Operation::Keys { .. } => "keys",
            Operation::List { .. } => "list",
            Operation::Clear { .. } => "clear",
            Operation::Sql { .. } => "sql",
        }
    }

    /// Target store, `None` for raw SQL.
    pub fn store(&self) -> Option<&str> {
        match self {
            Operation::Add { store, .. }
            | Operation::Put { store, .. }
            | Operation::Get { store, .. }
            | Operation::Count { store, .. }
            | Operation::Keys { store, .. }
            | Operation::List { store, .. }
            | Operation::Clear { store, .. } => Some(store),
            Operation::Sql { .. } => None,
        }
    }

    /// True for operations that always modify a store. Raw SQL is
    /// classified by the backend running it.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Add { .. } | Operation::Put { .. } | Operation::Clear { .. }
        )
    }
}

/// Result of an [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Keys(Vec<Key>),
    Record(Option<Value>),
    Records(Vec<Value>),
    Count(u64),
}

impl Outcome {
    fn mismatch(&self, expected: &str) -> StorageError {
        StorageError::Backend(format!("expected {expected} outcome, got {self:?}"))
    }

    pub fn into_keys(self) -> StorageResult<Vec<Key>> {
        match self {
            Outcome::Keys(keys) => Ok(keys),
            other => Err(other.mismatch("keys")),
        }
    }

    pub fn into_record(self) -> StorageResult<Option<Value>> {
        match self {
            Outcome::Record(record) => Ok(record),
            other => Err(other.mismatch("record")),
        }
    }

    pub fn into_records(self) -> StorageResult<Vec<Value>> {
        match self {
            Outcome::Records(records) => Ok(records),
            other => Err(other.mismatch("records")),
        }
    }

    pub fn into_count(self) -> StorageResult<u64> {
        match self {
            Outcome::Count(count) => Ok(count),
            other => Err(other.mismatch("count")),
        }
    }
}

/// Asynchronous host storage driver.
///
/// The driver owns one connection and hands out opaque transaction handles.
/// The scheduler guarantees that at most one handle is open at a time, that
/// `exec` is only called with an open handle, and that every opened handle
/// is finished by exactly one `commit` or `abort`.
pub trait Backend: Send + Sync + 'static {
    /// Host transaction handle.
    type Handle: Send + Sync + 'static;

    /// Short driver name, e.g. `"memory"` or `"sqlite"`.
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Create whatever the schema needs (tables, object stores).
    fn prepare(&self, schema: Arc<DatabaseSchema>) -> impl Future<Output = BackendResult<()>> + Send;

    /// Open a host transaction over `scope`.
    fn open(
        &self,
        scope: &Scope,
        mode: TransactionMode,
    ) -> impl Future<Output = BackendResult<Self::Handle>> + Send;

    /// Run one operation inside an open transaction.
    ///
    /// A fatal error (see [`BackendError::is_fatal`](crate::storage::BackendError::is_fatal))
    /// means the host already dropped the transaction.
    fn exec(
        &self,
        handle: &Self::Handle,
        op: Operation,
    ) -> impl Future<Output = BackendResult<Outcome>> + Send;

    /// Commit and report how the transaction ended.
    fn commit(&self, handle: &Self::Handle) -> impl Future<Output = TerminalEvent> + Send;

    /// Roll back and report the terminal event.
    fn abort(&self, handle: &Self::Handle, reason: &str) -> impl Future<Output = TerminalEvent> + Send;
}
