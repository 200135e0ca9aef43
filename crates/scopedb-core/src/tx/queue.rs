//! Transaction queue: turns scoped requests into host transactions
//!
//! Every queue owns a driver task. Requests arrive over a channel, are kept
//! in FIFO order, and are served one transaction context at a time: the head
//! request plus any immediately following compatible requests share a
//! context, and requests queued later that the open context covers run in it
//! too. The connection mutex in [`Shared`] keeps at most one context Active
//! across every queue of one facade.
//!
//! A request issued from inside a transaction callback on the same
//! connection joins the open context instead of queueing, provided the
//! context covers its scope and mode. Once that context has ended, such a
//! request fails with the context's terminal error.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::schema::DatabaseSchema;
use crate::service::CrudService;
use crate::storage::{Backend, Capabilities};
use crate::tracing::prefix;
use crate::tx::context::TransactionContext;
use crate::tx::request::{settle, Deferred, Reply, Request, Settle, Task};
use crate::tx::session::{scoped, Session};
use crate::tx::types::{Scope, TransactionMode};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic transaction sequence counter shared by every queue of a facade.
#[derive(Debug, Clone, Default)]
pub struct TxCounter(Arc<AtomicU64>);

impl TxCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence number, starting at 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last allocated sequence number, 0 before the first transaction.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// State shared by every queue on one connection.
pub(crate) struct Shared<B: Backend> {
    id: u64,
    schema: Arc<DatabaseSchema>,
    backend: B,
    config: StorageConfig,
    connection: tokio::sync::Mutex<()>,
    counter: TxCounter,
}

impl<B: Backend> Shared<B> {
    pub fn new(schema: Arc<DatabaseSchema>, backend: B, config: StorageConfig) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            schema,
            backend,
            config,
            connection: tokio::sync::Mutex::new(()),
            counter: TxCounter::new(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn schema(&self) -> &Arc<DatabaseSchema> {
        &self.schema
    }

    pub fn counter(&self) -> &TxCounter {
        &self.counter
    }
}

enum Message<B: Backend> {
    Request(Request<B>),
    Close,
}

struct QueueInner<B: Backend> {
    name: String,
    shared: Arc<Shared<B>>,
    sender: mpsc::UnboundedSender<Message<B>>,
    closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// FIFO scheduler of scoped requests onto host transactions.
pub struct TxQueue<B: Backend> {
    inner: Arc<QueueInner<B>>,
}

impl<B: Backend> Clone for TxQueue<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> TxQueue<B> {
    /// Start a queue and its driver task. Must be called inside a Tokio runtime.
    pub(crate) fn spawn(name: impl Into<String>, shared: Arc<Shared<B>>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                shared,
                sender,
                closed: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        };
        let driver = Driver {
            queue: queue.clone(),
            receiver,
            backlog: VecDeque::new(),
            closing: false,
        };
        *queue.inner.driver.lock() = Some(tokio::spawn(driver.run()));
        queue
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Last transaction sequence number allocated on this connection.
    pub fn tx_no(&self) -> u64 {
        self.inner.shared.counter.current()
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.inner.shared.id
    }

    pub(crate) fn backend(&self) -> &B {
        &self.inner.shared.backend
    }

    /// Stop accepting requests. Requests already queued still run.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("{} queue '{}' closing", prefix::CLOSE, self.inner.name);
            let _ = self.inner.sender.send(Message::Close);
        }
    }

    /// Close and wait for every queued request to finish.
    pub async fn shutdown(&self) {
        self.close();
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                warn!("{} queue '{}' driver failed: {}", prefix::CLOSE, self.inner.name, err);
            }
        }
    }

    /// Schedule `f`. Joins the current task's session when it covers the
    /// request, otherwise queues.
    pub(crate) fn submit<T, F, Fut>(
        &self,
        scope: Scope,
        mode: TransactionMode,
        label: &'static str,
        isolated: bool,
        f: F,
    ) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Session<B>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        if self.is_closed() {
            return Deferred::failed(StorageError::Closed(format!("queue '{}'", self.inner.name)));
        }

        if !isolated {
            if let Some(session) = Session::<B>::current(self.connection_id()) {
                if session.covers(&scope, mode) {
                    trace!("{} tx {} {} joined", prefix::DB, session.sequence(), label);
                    return Deferred::joined(f(session));
                }
                // the enclosing callback still holds the connection, so
                // queueing behind it would never resolve
                if session.has_ended() && session.spans(&scope, mode) {
                    trace!("{} tx {} {} after terminal event", prefix::DB, session.sequence(), label);
                    return Deferred::failed(session.failure());
                }
                warn!(
                    "{} {} {} {} queued from inside tx {}; it runs after that transaction ends",
                    prefix::DB,
                    label,
                    mode,
                    scope,
                    session.sequence()
                );
            }
        }

        let (sender, receiver) = oneshot::channel();
        let reply = Reply::new(sender);
        let on_settle = reply.clone();
        let run = Box::new(move |session: Session<B>| -> Task {
            Box::pin(async move {
                let result = f(session).await;
                Box::new(move |verdict: StorageResult<()>| {
                    on_settle.send(settle(result, verdict));
                }) as Settle
            })
        });
        let request = Request {
            scope,
            mode,
            label,
            isolated,
            run,
            reject: Box::new(move |err| {
                reply.send(Err(err));
            }),
        };
        trace!("{} queue '{}' {} {:?}", prefix::DB, self.inner.name, label, request.scope);

        if let Err(mpsc::error::SendError(message)) = self.inner.sender.send(Message::Request(request)) {
            if let Message::Request(request) = message {
                (request.reject)(StorageError::Closed(format!("queue '{}'", self.inner.name)));
            }
        }
        Deferred::queued(receiver)
    }
}

impl<B: Backend> CrudService<B> for TxQueue<B> {
    fn schema(&self) -> &DatabaseSchema {
        &self.inner.shared.schema
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.shared.backend.capabilities()
    }

    fn dispatch<T, F, Fut>(&self, scope: Scope, mode: TransactionMode, label: &'static str, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Session<B>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        self.submit(scope, mode, label, false, f)
    }
}

impl<B: Backend> std::fmt::Debug for TxQueue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxQueue")
            .field("name", &self.inner.name)
            .field("connection", &self.inner.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Driver<B: Backend> {
    queue: TxQueue<B>,
    receiver: mpsc::UnboundedReceiver<Message<B>>,
    backlog: VecDeque<Request<B>>,
    closing: bool,
}

impl<B: Backend> Driver<B> {
    async fn run(mut self) {
        debug!("{} queue '{}' started", prefix::OPEN, self.queue.name());
        while let Some(head) = self.next_request().await {
            self.serve(head).await;
        }
        debug!("{} queue '{}' stopped", prefix::CLOSE, self.queue.name());
    }

    async fn next_request(&mut self) -> Option<Request<B>> {
        loop {
            if let Some(request) = self.backlog.pop_front() {
                return Some(request);
            }
            let message = if self.closing {
                self.receiver.try_recv().ok()?
            } else {
                self.receiver.recv().await?
            };
            match message {
                Message::Request(request) => return Some(request),
                Message::Close => self.closing = true,
            }
        }
    }

    fn drain_incoming(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                Message::Request(request) => self.backlog.push_back(request),
                Message::Close => self.closing = true,
            }
        }
    }

    fn limit(&self) -> usize {
        let config = self.queue.inner.shared.config();
        if config.coalesce {
            config.max_requests_per_transaction.max(1)
        } else {
            1
        }
    }

    /// Pop the requests that open a context together with `head`.
    fn batch(&mut self, head: Request<B>) -> (Scope, TransactionMode, Vec<Request<B>>) {
        let mode = head.mode;
        let mut scope = head.scope.clone();
        let isolated = head.isolated;
        let mut batch = vec![head];
        if isolated {
            return (scope, mode, batch);
        }
        let limit = self.limit();
        while batch.len() < limit {
            let compatible = matches!(
                self.backlog.front(),
                Some(next) if !next.isolated && mode.satisfies(next.mode)
            );
            if !compatible {
                break;
            }
            if let Some(next) = self.backlog.pop_front() {
                scope.extend(&next.scope);
                batch.push(next);
            }
        }
        (scope, mode, batch)
    }

    async fn serve(&mut self, head: Request<B>) {
        self.drain_incoming();
        let (scope, mode, batch) = self.batch(head);
        let shared = self.queue.inner.shared.clone();

        let _connection = shared.connection.lock().await;
        let context = Arc::new(TransactionContext::new(shared.counter.next(), scope, mode));
        if let Err(err) = context.open(shared.backend()).await {
            for request in batch {
                (request.reject)(err.clone());
            }
            return;
        }

        let limit = self.limit();
        let mut settlers = Vec::with_capacity(batch.len());
        let mut served = 0;
        for request in batch {
            run_request(&self.queue, &context, request, &mut settlers).await;
            served += 1;
        }

        // keep serving queued requests the open context covers
        while served < limit && context.is_active() {
            self.drain_incoming();
            let covered = matches!(
                self.backlog.front(),
                Some(next) if !next.isolated && context.covers(&next.scope, next.mode)
            );
            if !covered {
                break;
            }
            if let Some(request) = self.backlog.pop_front() {
                run_request(&self.queue, &context, request, &mut settlers).await;
                served += 1;
            }
        }

        context.commit(shared.backend()).await;
        let verdict = context.verdict();
        trace!(
            "{} tx {} served {} request(s), {} settling",
            prefix::DB,
            context.seq(),
            served,
            settlers.len()
        );
        for deliver in settlers {
            deliver(verdict.clone());
        }
    }
}

/// Run one request's callback against `context`, collecting its settler.
async fn run_request<B: Backend>(
    queue: &TxQueue<B>,
    context: &Arc<TransactionContext<B>>,
    request: Request<B>,
    settlers: &mut Vec<Settle>,
) {
    if !context.is_active() {
        (request.reject)(context.failure());
        return;
    }
    let label = request.label;
    let session = Session::bind(queue.clone(), context.clone(), label);
    let task = scoped(&session, (request.run)(session.clone()));
    drop(session);

    match tokio::spawn(task).await {
        Ok(deliver) => settlers.push(deliver),
        Err(err) => {
            let message = panic_message(err);
            warn!("{} tx {} {} callback failed: {}", prefix::DB, context.seq(), label, message);
            (request.reject)(StorageError::ListenerFault(message));
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
