//! Storage error types

use thiserror::Error;

use crate::schema::SchemaError;
use crate::storage::BackendError;
use crate::tx::TerminalKind;

/// Errors returned by the storage facade, queues and sessions.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Unknown store or index, empty scope, malformed record
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The transaction this request was queued on did not commit
    #[error("transaction {tx} ended with {kind}: {reason}")]
    TransactionAborted {
        tx: u64,
        kind: TerminalKind,
        reason: String,
    },

    /// Operation issued through a session whose transaction already ended
    #[error("transaction {0} is not active")]
    TransactionInactive(u64),

    /// Capability not offered by the backend
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A transaction callback panicked
    #[error("callback panicked: {0}")]
    ListenerFault(String),

    /// Key or unique index violation
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Request-local backend failure
    #[error("backend error: {0}")]
    Backend(String),

    #[error("schema error: {0}")]
    Schema(String),

    /// Queue or facade closed
    #[error("closed: {0}")]
    Closed(String),
}

impl From<SchemaError> for StorageError {
    fn from(err: SchemaError) -> Self {
        StorageError::Schema(err.to_string())
    }
}

impl From<BackendError> for StorageError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Constraint(msg) => StorageError::Constraint(msg),
            BackendError::NotSupported(msg) => StorageError::NotSupported(msg),
            BackendError::Request(msg) => StorageError::Backend(msg),
            // fatal errors are normally turned into TransactionAborted by the session
            fatal => StorageError::Backend(fatal.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
