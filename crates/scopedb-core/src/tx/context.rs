//! Transaction context: one host transaction, its scope and its terminal event

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{StorageError, StorageResult};
use crate::storage::{Backend, BackendError};
use crate::tracing::prefix;
use crate::tx::types::{Scope, TerminalEvent, TerminalKind, TransactionMode, TxState};

/// Callback told how a transaction ended: `complete`, `error` or `abort`,
/// with the backend's detail message if there is one.
pub type CompletionListener = Box<dyn FnOnce(TerminalKind, Option<&str>) + Send>;

/// Owns one host transaction handle from open to terminal event.
///
/// State moves `Created -> Active -> {Completed, Errored, Aborted}`, or
/// `Created -> Errored` when the backend refuses to open. The terminal
/// transition happens once, and the completion listener runs at that point.
pub struct TransactionContext<B: Backend> {
    seq: u64,
    scope: Scope,
    mode: TransactionMode,
    state: Mutex<TxState>,
    handle: Mutex<Option<Arc<B::Handle>>>,
    listener: Mutex<Option<CompletionListener>>,
    outcome: Mutex<Option<TerminalEvent>>,
    sessions: AtomicUsize,
}

impl<B: Backend> TransactionContext<B> {
    pub fn new(seq: u64, scope: Scope, mode: TransactionMode) -> Self {
        Self {
            seq,
            scope,
            mode,
            state: Mutex::new(TxState::Created),
            handle: Mutex::new(None),
            listener: Mutex::new(None),
            outcome: Mutex::new(None),
            sessions: AtomicUsize::new(0),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxState::Active
    }

    /// Terminal event, once there is one.
    pub fn outcome(&self) -> Option<TerminalEvent> {
        self.outcome.lock().clone()
    }

    /// True once a terminal event was delivered.
    pub fn has_ended(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// True if `scope` in `mode` lies within this context's scope and mode,
    /// whatever its state.
    pub fn spans(&self, scope: &Scope, mode: TransactionMode) -> bool {
        self.scope.is_superset(scope) && self.mode.satisfies(mode)
    }

    /// True if this context is Active and can serve `scope` in `mode`.
    pub fn covers(&self, scope: &Scope, mode: TransactionMode) -> bool {
        self.is_active() && self.spans(scope, mode)
    }

    /// Host handle, only while Active.
    pub fn handle(&self) -> Option<Arc<B::Handle>> {
        if !self.is_active() {
            return None;
        }
        self.handle.lock().clone()
    }

    /// Number of sessions currently bound to this context.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn bind(&self) -> usize {
        self.sessions.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn unbind(&self) -> usize {
        self.sessions.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    /// Register the completion listener, replacing any earlier one. If the
    /// context already ended the listener runs immediately.
    pub fn set_listener(&self, listener: CompletionListener) {
        let finished = {
            let outcome = self.outcome.lock();
            if outcome.is_none() {
                *self.listener.lock() = Some(listener);
                return;
            }
            outcome.clone()
        };
        if let Some(event) = finished {
            self.notify(listener, &event);
        }
    }

    /// Ask the backend for a host transaction and become Active.
    pub async fn open(&self, backend: &B) -> StorageResult<()> {
        if self.state() != TxState::Created {
            return Err(StorageError::TransactionInactive(self.seq));
        }
        match backend.open(&self.scope, self.mode).await {
            Ok(handle) => {
                *self.handle.lock() = Some(Arc::new(handle));
                *self.state.lock() = TxState::Active;
                debug!(
                    "{} tx {} open {} {} on {}",
                    prefix::DB,
                    self.seq,
                    self.mode,
                    self.scope,
                    backend.kind()
                );
                Ok(())
            }
            Err(err) => {
                warn!("{} tx {} open failed: {}", prefix::DB, self.seq, err);
                self.on_terminal(TerminalEvent::error(err.to_string()));
                Err(self.failure())
            }
        }
    }

    /// Commit the host transaction. No-op unless Active.
    pub async fn commit(&self, backend: &B) {
        let Some(handle) = self.take_handle() else {
            return;
        };
        let event = backend.commit(&handle).await;
        self.on_terminal(event);
    }

    /// Roll back the host transaction and end with `event`. No-op once the
    /// context has left the Active state.
    pub async fn terminate(&self, backend: &B, event: TerminalEvent) {
        let Some(handle) = self.take_handle() else {
            return;
        };
        let reason = event.detail.as_deref().unwrap_or(event.kind.as_str());
        let _ = backend.abort(&handle, reason).await;
        self.on_terminal(event);
    }

    /// End the transaction after the backend reported a fatal error.
    pub(crate) async fn fail(&self, backend: &B, err: &BackendError) {
        let event = match err {
            BackendError::Aborted(reason) => TerminalEvent::abort(reason.clone()),
            other => TerminalEvent::error(other.to_string()),
        };
        self.terminate(backend, event).await;
    }

    /// Deliver the terminal event. Only the first call has any effect.
    pub fn on_terminal(&self, event: TerminalEvent) {
        {
            let mut outcome = self.outcome.lock();
            if outcome.is_some() {
                trace!("{} tx {} duplicate terminal event ignored", prefix::DB, self.seq);
                return;
            }
            *outcome = Some(event.clone());
        }
        *self.state.lock() = TxState::from(event.kind);
        self.handle.lock().take();
        debug!(
            "{} tx {} {}{}",
            prefix::DB,
            self.seq,
            event.kind,
            event.detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
        );

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            self.notify(listener, &event);
        }
    }

    /// Ok if the context committed, otherwise the error every request still
    /// pending on it resolves with.
    pub fn verdict(&self) -> StorageResult<()> {
        match self.outcome() {
            Some(event) if event.is_complete() => Ok(()),
            _ => Err(self.failure()),
        }
    }

    pub fn failure(&self) -> StorageError {
        match self.outcome() {
            Some(event) if !event.is_complete() => StorageError::TransactionAborted {
                tx: self.seq,
                kind: event.kind,
                reason: event.detail.unwrap_or_default(),
            },
            _ => StorageError::TransactionInactive(self.seq),
        }
    }

    fn take_handle(&self) -> Option<Arc<B::Handle>> {
        let state = self.state.lock();
        if *state != TxState::Active {
            return None;
        }
        self.handle.lock().take()
    }

    fn notify(&self, listener: CompletionListener, event: &TerminalEvent) {
        let detail = event.detail.as_deref();
        if catch_unwind(AssertUnwindSafe(|| listener(event.kind, detail))).is_err() {
            warn!("{} tx {} completion listener panicked", prefix::DB, self.seq);
        }
    }
}

impl<B: Backend> std::fmt::Debug for TransactionContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("seq", &self.seq)
            .field("scope", &self.scope)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}
