//! In-memory storage backend
//!
//! Every transaction works on a private snapshot of the stores in its scope.
//! Commit writes the snapshot back, abort drops it. Useful for tests and
//! short-lived processes that don't need persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::key::{Key, KeyRange};
use crate::query::{Direction, Query};
use crate::schema::{ColumnValue, DatabaseSchema, StoreSchema};
use crate::storage::error::{BackendError, BackendResult};
use crate::storage::traits::{Backend, Capabilities, Operation, Outcome};
use crate::tx::{Scope, TerminalEvent, TransactionMode};

/// Failure the memory backend can be told to produce, for exercising
/// scheduler error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `exec` reports the transaction as aborted by the host
    AbortExec,
    /// `exec` fails the single operation
    FailExec,
    /// `commit` ends with an error event
    FailCommit,
    /// `open` is refused
    RefuseOpen,
}

#[derive(Debug)]
struct Armed {
    fault: Fault,
    skip: usize,
}

#[derive(Debug, Clone, Default)]
struct StoreData {
    records: BTreeMap<Key, Value>,
    next_key: u64,
}

/// Open transaction on a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryTx {
    id: u64,
    scope: Scope,
    mode: TransactionMode,
    inner: Mutex<TxInner>,
}

#[derive(Debug)]
struct TxInner {
    working: HashMap<String, StoreData>,
    aborted: Option<String>,
    finished: bool,
}

impl MemoryTx {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    schema: RwLock<Option<Arc<DatabaseSchema>>>,
    stores: Mutex<HashMap<String, StoreData>>,
    faults: Mutex<Vec<Armed>>,
    opened: AtomicU64,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `fault` to fire on the `after`-th matching call from now (0 = next).
    pub fn inject(&self, fault: Fault, after: usize) {
        self.faults.lock().push(Armed { fault, skip: after });
    }

    /// Committed records of `store` in key order (for testing).
    pub fn snapshot(&self, store: &str) -> Vec<Value> {
        self.stores
            .lock()
            .get(store)
            .map(|data| data.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of host transactions opened so far.
    pub fn transactions_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    fn trip(&self, fault: Fault) -> bool {
        let mut faults = self.faults.lock();
        let Some(pos) = faults.iter().position(|armed| armed.fault == fault) else {
            return false;
        };
        if faults[pos].skip == 0 {
            faults.remove(pos);
            true
        } else {
            faults[pos].skip -= 1;
            false
        }
    }

    fn trip_exec(&self) -> Option<Fault> {
        [Fault::AbortExec, Fault::FailExec]
            .into_iter()
            .find(|fault| self.trip(*fault))
    }

    fn store_schema(&self, name: &str) -> BackendResult<StoreSchema> {
        self.schema
            .read()
            .as_ref()
            .and_then(|schema| schema.store(name).cloned())
            .ok_or_else(|| BackendError::Request(format!("unknown store '{name}'")))
    }
}

impl Backend for MemoryBackend {
    type Handle = MemoryTx;

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            cursor: true,
            sql: false,
        }
    }

    async fn prepare(&self, schema: Arc<DatabaseSchema>) -> BackendResult<()> {
        let mut stores = self.stores.lock();
        for store in schema.stores() {
            stores.entry(store.name().to_string()).or_default();
        }
        *self.schema.write() = Some(schema);
        Ok(())
    }

    async fn open(&self, scope: &Scope, mode: TransactionMode) -> BackendResult<MemoryTx> {
        if self.trip(Fault::RefuseOpen) {
            return Err(BackendError::Transaction("open refused".into()));
        }
        let stores = self.stores.lock();
        let mut working = HashMap::new();
        for name in scope.iter() {
            let data = stores
                .get(name)
                .ok_or_else(|| BackendError::Transaction(format!("unknown store '{name}'")))?;
            working.insert(name.to_string(), data.clone());
        }
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryTx {
            id,
            scope: scope.clone(),
            mode,
            inner: Mutex::new(TxInner {
                working,
                aborted: None,
                finished: false,
            }),
        })
    }

    async fn exec(&self, tx: &MemoryTx, op: Operation) -> BackendResult<Outcome> {
        let mut inner = tx.inner.lock();
        if let Some(reason) = &inner.aborted {
            return Err(BackendError::Aborted(reason.clone()));
        }
        if inner.finished {
            return Err(BackendError::Transaction(format!("transaction {} finished", tx.id)));
        }
        match self.trip_exec() {
            Some(Fault::AbortExec) => {
                let reason = format!("injected abort during {}", op.name());
                inner.aborted = Some(reason.clone());
                inner.working.clear();
                return Err(BackendError::Aborted(reason));
            }
            Some(_) => return Err(BackendError::Request(format!("injected failure during {}", op.name()))),
            None => {}
        }

        let Some(name) = op.store() else {
            return Err(BackendError::NotSupported("sql on memory backend".into()));
        };
        if op.is_write() && !tx.mode.is_write() {
            return Err(BackendError::Request(format!("{} in a readonly transaction", op.name())));
        }
        let schema = self.store_schema(name)?;
        let data = inner
            .working
            .get_mut(name)
            .ok_or_else(|| BackendError::Request(format!("store '{name}' is not in transaction scope")))?;

        match op {
            Operation::Add { records, .. } => write(&schema, data, records, false).map(Outcome::Keys),
            Operation::Put { records, .. } => write(&schema, data, records, true).map(Outcome::Keys),
            Operation::Get { query, .. } => {
                let record = match &query {
                    Query::Key(key) => data.records.get(key).cloned(),
                    _ => select(&schema, data, &query).first().map(|(_, record)| (*record).clone()),
                };
                Ok(Outcome::Record(record))
            }
            Operation::Count { query, .. } => Ok(Outcome::Count(select(&schema, data, &query).len() as u64)),
            Operation::Keys { query, .. } => Ok(Outcome::Keys(
                select(&schema, data, &query).into_iter().map(|(key, _)| key.clone()).collect(),
            )),
            Operation::List { query, .. } => Ok(Outcome::Records(
                select(&schema, data, &query)
                    .into_iter()
                    .map(|(_, record)| record.clone())
                    .collect(),
            )),
            Operation::Clear { query, .. } => {
                let doomed: Vec<Key> = select(&schema, data, &query)
                    .into_iter()
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &doomed {
                    data.records.remove(key);
                }
                Ok(Outcome::Count(doomed.len() as u64))
            }
            Operation::Sql { .. } => Err(BackendError::NotSupported("sql on memory backend".into())),
        }
    }

    async fn commit(&self, tx: &MemoryTx) -> TerminalEvent {
        let mut inner = tx.inner.lock();
        if let Some(reason) = &inner.aborted {
            return TerminalEvent::abort(reason.clone());
        }
        if inner.finished {
            return TerminalEvent::error(format!("transaction {} already finished", tx.id));
        }
        inner.finished = true;
        if self.trip(Fault::FailCommit) {
            return TerminalEvent::error("injected commit failure");
        }
        if tx.mode.is_write() {
            let mut stores = self.stores.lock();
            for (name, data) in inner.working.drain() {
                stores.insert(name, data);
            }
        }
        TerminalEvent::complete()
    }

    async fn abort(&self, tx: &MemoryTx, reason: &str) -> TerminalEvent {
        let mut inner = tx.inner.lock();
        inner.finished = true;
        inner.working.clear();
        match inner.aborted.take() {
            Some(host_reason) => TerminalEvent::abort(host_reason),
            None => TerminalEvent::abort(reason),
        }
    }
}

/// Write every record or none of them. Records are staged on a copy of the
/// store and published only once the whole batch succeeded.
fn write(
    schema: &StoreSchema,
    data: &mut StoreData,
    records: Vec<Value>,
    replace: bool,
) -> BackendResult<Vec<Key>> {
    let mut staged = data.clone();
    let keys = stage(schema, &mut staged, records, replace)?;
    *data = staged;
    Ok(keys)
}

fn stage(
    schema: &StoreSchema,
    data: &mut StoreData,
    records: Vec<Value>,
    replace: bool,
) -> BackendResult<Vec<Key>> {
    let mut keys = Vec::with_capacity(records.len());
    for mut record in records {
        let key = match schema.key_of(&record) {
            Some(key) => key,
            None if schema.is_auto_increment() => {
                data.next_key = data.next_key.checked_add(1).ok_or_else(|| {
                    BackendError::Constraint(format!("key generator of '{}' exhausted", schema.name()))
                })?;
                schema.assign_key(&mut record, Value::from(data.next_key));
                Key::Number(data.next_key as f64)
            }
            None => {
                return Err(BackendError::Request(format!(
                    "record has no key at '{}'",
                    schema.key_path()
                )))
            }
        };
        if let Key::Number(n) = key {
            if n.fract() == 0.0 && n > data.next_key as f64 {
                data.next_key = n as u64;
            }
        }
        if !replace && data.records.contains_key(&key) {
            return Err(BackendError::Constraint(format!(
                "key {key} already exists in '{}'",
                schema.name()
            )));
        }
        check_unique(schema, data, &key, &record)?;
        data.records.insert(key.clone(), record);
        keys.push(key);
    }
    Ok(keys)
}

fn check_unique(schema: &StoreSchema, data: &StoreData, key: &Key, record: &Value) -> BackendResult<()> {
    for index in schema.indexes().iter().filter(|index| index.unique) {
        let Some(value) = index_key(schema, record, &index.name) else {
            continue;
        };
        let clash = data
            .records
            .iter()
            .any(|(other, existing)| other != key && index_key(schema, existing, &index.name).as_ref() == Some(&value));
        if clash {
            return Err(BackendError::Constraint(format!(
                "duplicate value {value} for unique index '{}' in '{}'",
                index.name,
                schema.name()
            )));
        }
    }
    Ok(())
}

/// Key form of a record's indexed field. NaN coercions are not indexed.
fn index_key(schema: &StoreSchema, record: &Value, index: &str) -> Option<Key> {
    if index == schema.key_path() {
        return schema.key_of(record);
    }
    match schema.project_indexed_values(record).column(index)? {
        ColumnValue::Integer(i) => Some(Key::Number(*i as f64)),
        ColumnValue::Float(f) if !f.is_nan() => Some(Key::Number(*f)),
        ColumnValue::Text(s) => Some(Key::Text(s.clone())),
        _ => None,
    }
}

fn select<'a>(schema: &StoreSchema, data: &'a StoreData, query: &Query) -> Vec<(&'a Key, &'a Value)> {
    match query {
        Query::All => data.records.iter().collect(),
        Query::Key(key) => data.records.get_key_value(key).into_iter().collect(),
        Query::Range(range) => by_primary(data, range),
        Query::Index { name, range } => by_index(schema, data, name, range),
        Query::Cursor(cursor) => {
            let mut rows = match cursor.index.as_deref() {
                Some(name) => by_index(schema, data, name, &cursor.range),
                None => by_primary(data, &cursor.range),
            };
            if cursor.direction == Direction::Prev {
                rows.reverse();
            }
            cursor.window(rows)
        }
    }
}

fn by_primary<'a>(data: &'a StoreData, range: &KeyRange) -> Vec<(&'a Key, &'a Value)> {
    data.records.iter().filter(|(key, _)| range.contains(key)).collect()
}

fn by_index<'a>(
    schema: &StoreSchema,
    data: &'a StoreData,
    index: &str,
    range: &KeyRange,
) -> Vec<(&'a Key, &'a Value)> {
    if index == schema.key_path() {
        return by_primary(data, range);
    }
    let mut rows: Vec<(Key, &'a Key, &'a Value)> = data
        .records
        .iter()
        .filter_map(|(key, record)| {
            let value = index_key(schema, record, index)?;
            range.contains(&value).then_some((value, key, record))
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    rows.into_iter().map(|(_, key, record)| (key, record)).collect()
}
