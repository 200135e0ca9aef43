//! Error types for the SQLite backend

use rusqlite::ErrorCode;
use scopedb_core::storage::BackendError;
use thiserror::Error;

/// Result type for SQLite backend operations
pub type Result<T> = std::result::Result<T, SqliteError>;

/// Errors that can occur inside the SQLite backend
#[derive(Debug, Error)]
pub enum SqliteError {
    /// Database connection or statement error
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Opaque column payload could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema could not be applied to the database
    #[error("Migration error: {0}")]
    Migration(String),

    /// Key shape SQLite columns cannot hold
    #[error("unsupported key {0}")]
    UnsupportedKey(String),

    /// Operation rejected before it reached SQLite
    #[error("{0}")]
    Invalid(String),
}

impl SqliteError {
    /// True for `UNIQUE` and `PRIMARY KEY` violations.
    pub fn is_constraint(&self) -> bool {
        matches!(
            self,
            SqliteError::Database(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation
        )
    }
}

/// Convert SqliteError to BackendError for the backend trait
impl From<SqliteError> for BackendError {
    fn from(err: SqliteError) -> Self {
        if err.is_constraint() {
            return BackendError::Constraint(err.to_string());
        }
        match err {
            SqliteError::UnsupportedKey(key) => BackendError::NotSupported(format!("key {key} on sqlite")),
            SqliteError::Migration(msg) => BackendError::Transaction(format!("Migration: {msg}")),
            other => BackendError::Request(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_constraint_maps_to_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err: SqliteError = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(err.is_constraint());
        assert!(matches!(BackendError::from(err), BackendError::Constraint(_)));
    }

    #[test]
    fn test_other_errors_stay_request_local() {
        let err = SqliteError::Invalid("nope".into());
        assert!(matches!(BackendError::from(err), BackendError::Request(msg) if msg == "nope"));
        let err = SqliteError::UnsupportedKey("[1]".into());
        assert!(matches!(BackendError::from(err), BackendError::NotSupported(_)));
    }
}
