//! Queued requests and their deferred results

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{StorageError, StorageResult};
use crate::storage::Backend;
use crate::tx::session::Session;
use crate::tx::types::{Scope, TransactionMode};

/// Delivers a request's result once its transaction's verdict is known.
pub(crate) type Settle = Box<dyn FnOnce(StorageResult<()>) + Send>;

/// A request's callback, running inside its transaction.
pub(crate) type Task = Pin<Box<dyn Future<Output = Settle> + Send>>;

/// One unit of work waiting for a transaction context.
pub(crate) struct Request<B: Backend> {
    pub scope: Scope,
    pub mode: TransactionMode,
    pub label: &'static str,
    /// Never joined or batched with other requests
    pub isolated: bool,
    pub run: Box<dyn FnOnce(Session<B>) -> Task + Send>,
    pub reject: Box<dyn FnOnce(StorageError) + Send>,
}

impl<B: Backend> std::fmt::Debug for Request<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("scope", &self.scope)
            .field("mode", &self.mode)
            .field("label", &self.label)
            .field("isolated", &self.isolated)
            .finish()
    }
}

/// Single-use reply slot shared by a request's settle and reject paths.
pub(crate) struct Reply<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<StorageResult<T>>>>>,
}

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Reply<T> {
    pub fn new(sender: oneshot::Sender<StorageResult<T>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Send `result` unless a result was already sent.
    pub fn send(&self, result: StorageResult<T>) -> bool {
        match self.slot.lock().take() {
            // receiver may be gone; the request still counts as resolved
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }
}

/// Combine a request's own result with its transaction's verdict.
pub(crate) fn settle<T>(result: StorageResult<T>, verdict: StorageResult<()>) -> StorageResult<T> {
    match (result, verdict) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), _) => Err(err),
    }
}

enum Inner<T> {
    Queued(oneshot::Receiver<StorageResult<T>>),
    Joined(Pin<Box<dyn Future<Output = StorageResult<T>> + Send>>),
}

/// Result of a storage operation, resolved exactly once.
///
/// Queued requests make progress whether or not the `Deferred` is polled.
/// Requests joined into an already open transaction run when awaited.
#[must_use = "joined requests do nothing unless awaited"]
pub struct Deferred<T> {
    inner: Inner<T>,
}

impl<T: Send + 'static> Deferred<T> {
    pub(crate) fn queued(receiver: oneshot::Receiver<StorageResult<T>>) -> Self {
        Self {
            inner: Inner::Queued(receiver),
        }
    }

    pub(crate) fn joined(future: impl Future<Output = StorageResult<T>> + Send + 'static) -> Self {
        Self {
            inner: Inner::Joined(Box::pin(future)),
        }
    }

    /// Already resolved to `result`.
    pub fn ready(result: StorageResult<T>) -> Self {
        Self::joined(std::future::ready(result))
    }

    pub fn failed(err: StorageError) -> Self {
        Self::ready(Err(err))
    }

    pub fn map<U, F>(self, f: F) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Deferred::joined(async move { self.await.map(f) })
    }

    pub fn and_then<U, F>(self, f: F) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> StorageResult<U> + Send + 'static,
    {
        Deferred::joined(async move { self.await.and_then(f) })
    }

    /// True if the request went through the queue rather than joining.
    pub fn is_queued(&self) -> bool {
        matches!(self.inner, Inner::Queued(_))
    }
}

impl<T> Unpin for Deferred<T> {}

impl<T> Future for Deferred<T> {
    type Output = StorageResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Queued(receiver) => Pin::new(receiver).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(StorageError::Closed("request dropped before resolving".into()))
                })
            }),
            Inner::Joined(future) => future.as_mut().poll(cx),
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            Inner::Queued(_) => "queued",
            Inner::Joined(_) => "joined",
        };
        f.debug_tuple("Deferred").field(&kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_sends_once() {
        let (tx, rx) = oneshot::channel();
        let reply = Reply::new(tx);
        assert!(reply.clone().send(Ok(1)));
        assert!(!reply.send(Ok(2)));
        assert_eq!(Deferred::<i32>::queued(rx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_reply_resolves_closed() {
        let (tx, rx) = oneshot::channel::<StorageResult<()>>();
        drop(tx);
        assert!(matches!(Deferred::queued(rx).await, Err(StorageError::Closed(_))));
    }

    #[tokio::test]
    async fn test_map_and_then() {
        let doubled = Deferred::ready(Ok(21)).map(|n| n * 2);
        assert_eq!(doubled.await.unwrap(), 42);

        let rejected = Deferred::ready(Ok(1)).and_then(|_| -> StorageResult<i32> {
            Err(StorageError::Argument("nope".into()))
        });
        assert!(rejected.await.is_err());
    }

    #[test]
    fn test_verdict_overrides_success_only() {
        let aborted = StorageError::TransactionInactive(3);
        assert!(matches!(settle(Ok(1), Err(aborted.clone())), Err(StorageError::TransactionInactive(3))));
        assert!(matches!(
            settle::<i32>(Err(StorageError::Constraint("dup".into())), Err(aborted)),
            Err(StorageError::Constraint(_))
        ));
        assert_eq!(settle(Ok(5), Ok(())).unwrap(), 5);
    }
}
