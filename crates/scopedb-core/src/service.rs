//! CRUD surface shared by the facade, every queue and every bound session

use std::future::Future;

use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use crate::query::Query;
use crate::schema::{DatabaseSchema, StoreSchema};
use crate::storage::{Backend, Capabilities, Operation};
use crate::tx::{Deferred, Scope, Session, TransactionMode};

/// Storage operations, each returning a [`Deferred`] result.
///
/// Implementors only decide where a unit of work runs ([`dispatch`]); every
/// operation validates its arguments against the schema first, so unknown
/// stores and indexes fail before any transaction opens.
///
/// [`dispatch`]: CrudService::dispatch
pub trait CrudService<B: Backend> {
    fn schema(&self) -> &DatabaseSchema;

    fn capabilities(&self) -> Capabilities;

    /// Run `f` in a transaction over `scope` in `mode`.
    fn dispatch<T, F, Fut>(&self, scope: Scope, mode: TransactionMode, label: &'static str, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Session<B>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static;

    /// Insert a record. Fails with [`StorageError::Constraint`] if the key exists.
    fn add(&self, store: &str, record: Value) -> Deferred<Key> {
        first_key(self.add_all(store, vec![record]))
    }

    fn add_all(&self, store: &str, records: Vec<Value>) -> Deferred<Vec<Key>> {
        self.write(store, records, false, "add")
    }

    /// Insert or replace a record.
    fn put(&self, store: &str, record: Value) -> Deferred<Key> {
        first_key(self.put_all(store, vec![record]))
    }

    fn put_all(&self, store: &str, records: Vec<Value>) -> Deferred<Vec<Key>> {
        self.write(store, records, true, "put")
    }

    /// [`add`](Self::add) with `key` written to the store's key path,
    /// replacing any key the record already carries.
    fn add_with_key(&self, store: &str, record: Value, key: impl Into<Key>) -> Deferred<Key> {
        match keyed(self.schema(), store, record, key.into()) {
            Ok(record) => self.add(store, record),
            Err(err) => Deferred::failed(err),
        }
    }

    /// [`put`](Self::put) with `key` written to the store's key path.
    fn put_with_key(&self, store: &str, record: Value, key: impl Into<Key>) -> Deferred<Key> {
        match keyed(self.schema(), store, record, key.into()) {
            Ok(record) => self.put(store, record),
            Err(err) => Deferred::failed(err),
        }
    }

    /// First record matching `query`.
    fn get(&self, store: &str, query: impl Into<Query>) -> Deferred<Option<Value>> {
        let query = query.into();
        if let Err(err) = check_query(self, store, &query) {
            return Deferred::failed(err);
        }
        let op = Operation::Get {
            store: store.to_string(),
            query,
        };
        self.dispatch(Scope::from(store), TransactionMode::ReadOnly, "get", move |session| async move {
            session.exec(op).await?.into_record()
        })
    }

    fn count(&self, store: &str, query: impl Into<Query>) -> Deferred<u64> {
        let query = query.into();
        if let Err(err) = check_query(self, store, &query) {
            return Deferred::failed(err);
        }
        let op = Operation::Count {
            store: store.to_string(),
            query,
        };
        self.dispatch(Scope::from(store), TransactionMode::ReadOnly, "count", move |session| async move {
            session.exec(op).await?.into_count()
        })
    }

    fn keys(&self, store: &str, query: impl Into<Query>) -> Deferred<Vec<Key>> {
        let query = query.into();
        if let Err(err) = check_query(self, store, &query) {
            return Deferred::failed(err);
        }
        let op = Operation::Keys {
            store: store.to_string(),
            query,
        };
        self.dispatch(Scope::from(store), TransactionMode::ReadOnly, "keys", move |session| async move {
            session.exec(op).await?.into_keys()
        })
    }

    fn list(&self, store: &str, query: impl Into<Query>) -> Deferred<Vec<Value>> {
        let query = query.into();
        if let Err(err) = check_query(self, store, &query) {
            return Deferred::failed(err);
        }
        let op = Operation::List {
            store: store.to_string(),
            query,
        };
        self.dispatch(Scope::from(store), TransactionMode::ReadOnly, "list", move |session| async move {
            session.exec(op).await?.into_records()
        })
    }

    /// Parse delimited text (header line, then one record per line) and put
    /// every record.
    fn load(&self, store: &str, text: &str, delimiter: char) -> Deferred<Vec<Key>> {
        let records = match check_store(self.schema(), store) {
            Ok(schema) => schema.parse_delimited(text, delimiter),
            Err(err) => return Deferred::failed(err),
        };
        self.write(store, records, true, "load")
    }

    /// Delete the records matching `query`, resolving to the number removed.
    fn clear(&self, store: &str, query: impl Into<Query>) -> Deferred<u64> {
        let query = query.into();
        if let Err(err) = check_query(self, store, &query) {
            return Deferred::failed(err);
        }
        let op = Operation::Clear {
            store: store.to_string(),
            query,
        };
        self.dispatch(Scope::from(store), TransactionMode::ReadWrite, "clear", move |session| async move {
            session.exec(op).await?.into_count()
        })
    }

    /// Empty every store in `stores` in one transaction.
    fn clear_all(&self, stores: impl Into<Scope>) -> Deferred<u64> {
        let scope = stores.into();
        if let Err(err) = check_scope(self.schema(), &scope) {
            return Deferred::failed(err);
        }
        let ops: Vec<Operation> = scope
            .iter()
            .map(|store| Operation::Clear {
                store: store.to_string(),
                query: Query::All,
            })
            .collect();
        self.dispatch(scope, TransactionMode::ReadWrite, "clear", move |session| async move {
            let mut removed = 0;
            for op in ops {
                removed += session.exec(op).await?.into_count()?;
            }
            Ok(removed)
        })
    }

    /// Run raw SQL in a transaction over `scope`. Statements starting with
    /// `SELECT` run read-only. Needs a backend with the `sql` capability.
    fn execute_sql(&self, scope: impl Into<Scope>, sql: &str, params: Vec<Value>) -> Deferred<Vec<Value>> {
        if !self.capabilities().sql {
            return Deferred::failed(StorageError::NotSupported("sql".into()));
        }
        let scope = scope.into();
        if let Err(err) = check_scope(self.schema(), &scope) {
            return Deferred::failed(err);
        }
        let mode = if is_select(sql) {
            TransactionMode::ReadOnly
        } else {
            TransactionMode::ReadWrite
        };
        let op = Operation::Sql {
            sql: sql.to_string(),
            params,
        };
        self.dispatch(scope, mode, "sql", move |session| async move {
            session.exec(op).await?.into_records()
        })
    }

    /// Run `f` in one transaction over `scope`. Operations issued through
    /// the session, or through this service from inside `f`, join it.
    fn transaction<T, F, Fut>(&self, scope: impl Into<Scope>, mode: TransactionMode, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Session<B>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let scope = scope.into();
        if let Err(err) = check_scope(self.schema(), &scope) {
            return Deferred::failed(err);
        }
        self.dispatch(scope, mode, "transaction", f)
    }

    #[doc(hidden)]
    fn write(&self, store: &str, records: Vec<Value>, replace: bool, label: &'static str) -> Deferred<Vec<Key>> {
        if let Err(err) = check_records(self.schema(), store, &records) {
            return Deferred::failed(err);
        }
        let op = if replace {
            Operation::Put {
                store: store.to_string(),
                records,
            }
        } else {
            Operation::Add {
                store: store.to_string(),
                records,
            }
        };
        self.dispatch(Scope::from(store), TransactionMode::ReadWrite, label, move |session| async move {
            session.exec(op).await?.into_keys()
        })
    }
}

fn first_key(keys: Deferred<Vec<Key>>) -> Deferred<Key> {
    keys.and_then(|keys| {
        keys.into_iter()
            .next()
            .ok_or_else(|| StorageError::Backend("backend returned no key".into()))
    })
}

fn keyed(schema: &DatabaseSchema, store: &str, mut record: Value, key: Key) -> StorageResult<Value> {
    let store = check_store(schema, store)?;
    if !record.is_object() {
        return Err(StorageError::Argument(format!(
            "record for '{}' is not an object",
            store.name()
        )));
    }
    store.assign_key(&mut record, key.to_value());
    Ok(record)
}

fn is_select(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"))
}

pub(crate) fn check_store<'a>(schema: &'a DatabaseSchema, store: &str) -> StorageResult<&'a StoreSchema> {
    schema
        .store(store)
        .ok_or_else(|| StorageError::Argument(format!("unknown store '{store}'")))
}

pub(crate) fn check_scope(schema: &DatabaseSchema, scope: &Scope) -> StorageResult<()> {
    if scope.is_empty() {
        return Err(StorageError::Argument("empty scope".into()));
    }
    for store in scope.iter() {
        check_store(schema, store)?;
    }
    Ok(())
}

fn check_query<B: Backend, S: CrudService<B> + ?Sized>(service: &S, store: &str, query: &Query) -> StorageResult<()> {
    let schema = check_store(service.schema(), store)?;
    query.validate(schema).map_err(StorageError::Argument)?;
    if query.is_cursor() && !service.capabilities().cursor {
        return Err(StorageError::NotSupported(format!("cursor queries on '{store}'")));
    }
    Ok(())
}

pub(crate) fn check_records(schema: &DatabaseSchema, store: &str, records: &[Value]) -> StorageResult<()> {
    let store = check_store(schema, store)?;
    for record in records {
        if !record.is_object() {
            return Err(StorageError::Argument(format!(
                "record for '{}' is not an object",
                store.name()
            )));
        }
        match store.resolve_key(record) {
            Some(value) if Key::from_value(value).is_none() => {
                return Err(StorageError::Argument(format!(
                    "invalid key {value} at '{}'",
                    store.key_path()
                )))
            }
            None if !store.is_auto_increment() => {
                return Err(StorageError::Argument(format!(
                    "record for '{}' has no key at '{}'",
                    store.name(),
                    store.key_path()
                )))
            }
            _ => {}
        }
    }
    Ok(())
}
