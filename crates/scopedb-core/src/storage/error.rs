//! Backend error types

use thiserror::Error;

/// Errors a backend driver reports for a single operation or transaction.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Key or unique index violation
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Operation outside the driver's capabilities
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The operation failed; the transaction stays usable
    #[error("request failed: {0}")]
    Request(String),

    /// The host transaction was aborted and is gone
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// The host transaction could not be opened or failed as a whole
    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl BackendError {
    /// True if the error ends the host transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Aborted(_) | BackendError::Transaction(_))
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;
