//! Storage facade: the public entry point

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::StorageResult;
use crate::schema::DatabaseSchema;
use crate::service::CrudService;
use crate::storage::{Backend, Capabilities};
use crate::tracing::prefix;
use crate::tx::queue::Shared;
use crate::tx::{Deferred, Scope, Session, TransactionMode, TxQueue};

/// Owns the schema, the backend connection and the queues scheduling work on it.
///
/// Every CRUD call goes through the default queue. Dropping the facade
/// closes its queues; requests already queued still finish.
pub struct Storage<B: Backend> {
    shared: Arc<Shared<B>>,
    queue: TxQueue<B>,
    queues: Mutex<Vec<TxQueue<B>>>,
}

impl<B: Backend> Storage<B> {
    /// Validate `schema`, let the backend prepare its stores and start the
    /// default queue.
    pub async fn open(config: StorageConfig, schema: DatabaseSchema, backend: B) -> StorageResult<Self> {
        schema.validate()?;
        let schema = Arc::new(schema);
        backend.prepare(schema.clone()).await?;

        info!(
            "{} opened '{}' on {} with {} store(s)",
            prefix::DB,
            config.name,
            backend.kind(),
            schema.stores().len()
        );
        let default_queue = config.default_queue.clone();
        let shared = Arc::new(Shared::new(schema, backend, config));
        let queue = TxQueue::spawn(default_queue, shared.clone());
        Ok(Self {
            shared,
            queue: queue.clone(),
            queues: Mutex::new(vec![queue]),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config().name
    }

    /// Backend driver name.
    pub fn kind(&self) -> &'static str {
        self.shared.backend().kind()
    }

    /// Sequence number of the last transaction opened.
    pub fn tx_no(&self) -> u64 {
        self.shared.counter().current()
    }

    pub fn config(&self) -> &StorageConfig {
        self.shared.config()
    }

    pub fn backend(&self) -> &B {
        self.shared.backend()
    }

    /// Shared handle to the schema.
    pub fn shared_schema(&self) -> Arc<DatabaseSchema> {
        self.shared.schema().clone()
    }

    /// The default queue.
    pub fn queue(&self) -> &TxQueue<B> {
        &self.queue
    }

    /// Start another queue on the same connection. Transactions of all
    /// queues still run one at a time.
    pub fn new_queue(&self, name: impl Into<String>) -> TxQueue<B> {
        let queue = TxQueue::spawn(name, self.shared.clone());
        self.queues.lock().push(queue.clone());
        queue
    }

    /// Stop accepting requests on every queue.
    pub fn close(&self) {
        for queue in self.queues.lock().iter() {
            queue.close();
        }
    }

    /// Close every queue and wait for queued requests to finish.
    pub async fn shutdown(&self) {
        let queues = self.queues.lock().clone();
        for queue in queues {
            queue.shutdown().await;
        }
    }
}

impl<B: Backend> CrudService<B> for Storage<B> {
    fn schema(&self) -> &DatabaseSchema {
        self.shared.schema()
    }

    fn capabilities(&self) -> Capabilities {
        self.shared.backend().capabilities()
    }

    fn dispatch<T, F, Fut>(&self, scope: Scope, mode: TransactionMode, label: &'static str, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Session<B>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        self.queue.dispatch(scope, mode, label, f)
    }
}

impl<B: Backend> Drop for Storage<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: Backend> fmt::Display for Storage<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage:{}:{}", self.name(), self.tx_no())
    }
}

impl<B: Backend> fmt::Debug for Storage<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("tx_no", &self.tx_no())
            .finish()
    }
}
