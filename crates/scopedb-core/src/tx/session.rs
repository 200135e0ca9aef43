//! Bound session: a borrowed view of an Active transaction context
//!
//! A session is handed to every transaction callback. While the callback
//! runs, the session is also installed as the task's current session, so
//! facade calls made from inside the callback join the open transaction
//! instead of queueing behind it.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tracing::trace;

use crate::error::{StorageError, StorageResult};
use crate::schema::DatabaseSchema;
use crate::service::{check_scope, CrudService};
use crate::storage::{Backend, Capabilities, Operation, Outcome};
use crate::tracing::prefix;
use crate::tx::context::TransactionContext;
use crate::tx::queue::TxQueue;
use crate::tx::request::Deferred;
use crate::tx::types::{Scope, TerminalEvent, TerminalKind, TransactionMode};

tokio::task_local! {
    static CURRENT: Arc<dyn Any + Send + Sync>;
}

/// Run `future` with `session` installed as the task's current session.
pub(crate) fn scoped<B: Backend, F: Future>(session: &Session<B>, future: F) -> impl Future<Output = F::Output> {
    let erased: Arc<dyn Any + Send + Sync> = session.binding.clone();
    CURRENT.scope(erased, future)
}

struct Binding<B: Backend> {
    queue: TxQueue<B>,
    context: Arc<TransactionContext<B>>,
    label: &'static str,
}

impl<B: Backend> Drop for Binding<B> {
    fn drop(&mut self) {
        let left = self.context.unbind();
        trace!(
            "{} tx {} released {} session ({} bound)",
            prefix::DB,
            self.context.seq(),
            self.label,
            left
        );
    }
}

/// Handle to an Active transaction, valid for the duration of one callback.
///
/// Dropping the last clone releases the session. Operations issued through
/// a session after its transaction was aborted or errored fail with
/// [`StorageError::TransactionAborted`], and after it committed with
/// [`StorageError::TransactionInactive`].
pub struct Session<B: Backend> {
    binding: Arc<Binding<B>>,
}

impl<B: Backend> Clone for Session<B> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
        }
    }
}

impl<B: Backend> Session<B> {
    pub(crate) fn bind(queue: TxQueue<B>, context: Arc<TransactionContext<B>>, label: &'static str) -> Self {
        let bound = context.bind();
        trace!("{} tx {} bound {} session ({} bound)", prefix::DB, context.seq(), label, bound);
        Self {
            binding: Arc::new(Binding { queue, context, label }),
        }
    }

    /// Session installed on the current task for the connection `connection`.
    pub(crate) fn current(connection: u64) -> Option<Self> {
        let erased = CURRENT.try_with(Arc::clone).ok()?;
        let binding = erased.downcast::<Binding<B>>().ok()?;
        (binding.queue.connection_id() == connection).then_some(Self { binding })
    }

    /// Sequence number of the underlying transaction.
    pub fn sequence(&self) -> u64 {
        self.binding.context.seq()
    }

    pub fn scope(&self) -> &Scope {
        self.binding.context.scope()
    }

    pub fn mode(&self) -> TransactionMode {
        self.binding.context.mode()
    }

    pub fn label(&self) -> &'static str {
        self.binding.label
    }

    pub fn is_active(&self) -> bool {
        self.binding.context.is_active()
    }

    /// Host transaction handle while the transaction is Active.
    pub fn handle(&self) -> Option<Arc<B::Handle>> {
        self.binding.context.handle()
    }

    /// Queue that opened this session's transaction.
    pub fn queue(&self) -> &TxQueue<B> {
        &self.binding.queue
    }

    pub fn covers(&self, scope: &Scope, mode: TransactionMode) -> bool {
        self.binding.context.covers(scope, mode)
    }

    pub(crate) fn spans(&self, scope: &Scope, mode: TransactionMode) -> bool {
        self.binding.context.spans(scope, mode)
    }

    pub(crate) fn has_ended(&self) -> bool {
        self.binding.context.has_ended()
    }

    /// Error for work issued after the transaction left the Active state.
    pub(crate) fn failure(&self) -> StorageError {
        self.binding.context.failure()
    }

    /// Run `f` against this session's open transaction.
    ///
    /// Fails with [`StorageError::Argument`] if `scope` names an unknown
    /// store or is not covered by the transaction. Once the transaction
    /// ended it fails with the transaction's terminal error.
    /// Never opens a new transaction.
    pub fn join<R>(
        &self,
        scope: impl Into<Scope>,
        mode: TransactionMode,
        f: impl FnOnce(&Session<B>) -> R,
    ) -> StorageResult<R> {
        self.join_with(scope, mode, (), |session, ()| f(session))
    }

    /// [`join`](Self::join) with extra arguments bound after the session.
    pub fn join_with<A, R>(
        &self,
        scope: impl Into<Scope>,
        mode: TransactionMode,
        args: A,
        f: impl FnOnce(&Session<B>, A) -> R,
    ) -> StorageResult<R> {
        let scope = scope.into();
        check_scope(self.schema(), &scope)?;
        if !self.is_active() {
            return Err(self.failure());
        }
        if !self.covers(&scope, mode) {
            return Err(StorageError::Argument(format!(
                "{mode} {scope} is not covered by transaction {} ({} {})",
                self.sequence(),
                self.mode(),
                self.scope()
            )));
        }
        trace!("{} tx {} join {}", prefix::DB, self.sequence(), scope);
        Ok(f(self, args))
    }

    /// Queue `f` in a new transaction of its own.
    ///
    /// The connection holds one transaction at a time, so the nested
    /// transaction starts after this one ends. Awaiting the result from
    /// inside this session's callback never resolves.
    pub fn start_nested<T, F, Fut>(&self, scope: impl Into<Scope>, mode: TransactionMode, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Session<B>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let scope = scope.into();
        if let Err(err) = check_scope(self.schema(), &scope) {
            return Deferred::failed(err);
        }
        self.binding.queue.submit(scope, mode, "nested", true, f)
    }

    /// Register the listener told how this session's transaction ends.
    /// Replaces any listener registered earlier; a panicking listener is ignored.
    pub fn set_completed_listener(&self, listener: impl FnOnce(TerminalKind, Option<&str>) + Send + 'static) {
        self.binding.context.set_listener(Box::new(listener));
    }

    /// Roll back the transaction. Requests still pending on it resolve with
    /// [`StorageError::TransactionAborted`].
    pub async fn abort(&self, reason: &str) {
        let backend = self.binding.queue.backend();
        self.binding
            .context
            .terminate(backend, TerminalEvent::abort(reason))
            .await;
    }

    /// Explicitly end this handle's use of the session.
    pub fn release(self) {
        drop(self);
    }

    /// Execute one operation in the transaction. A fatal backend error ends
    /// the transaction.
    pub(crate) async fn exec(&self, op: Operation) -> StorageResult<Outcome> {
        let context = &self.binding.context;
        let handle = context
            .handle()
            .ok_or_else(|| context.failure())?;
        let backend = self.binding.queue.backend();
        trace!("{} tx {} {}", prefix::DB, context.seq(), op.name());
        match backend.exec(&handle, op).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_fatal() => {
                context.fail(backend, &err).await;
                Err(context.failure())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl<B: Backend> CrudService<B> for Session<B> {
    fn schema(&self) -> &DatabaseSchema {
        self.binding.queue.schema()
    }

    fn capabilities(&self) -> Capabilities {
        self.binding.queue.capabilities()
    }

    fn dispatch<T, F, Fut>(&self, scope: Scope, mode: TransactionMode, label: &'static str, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Session<B>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        match self.join(scope, mode, |session| session.clone()) {
            Ok(session) => {
                trace!("{} tx {} {} joined", prefix::DB, session.sequence(), label);
                Deferred::joined(f(session))
            }
            Err(err) => Deferred::failed(err),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tx", &self.sequence())
            .field("label", &self.label())
            .field("scope", self.scope())
            .field("mode", &self.mode())
            .finish()
    }
}
