//! Schema error types

use thiserror::Error;

/// Errors raised while building, validating or decoding a schema
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Two stores share a name
    #[error("duplicate store '{0}'")]
    DuplicateStore(String),

    /// Two indexes of one store share a name
    #[error("duplicate index '{index}' in store '{store}'")]
    DuplicateIndex { store: String, index: String },

    /// Store, index or key path is empty
    #[error("empty name: {0}")]
    EmptyName(String),

    /// Wire format could not be encoded or decoded
    #[error("schema JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
