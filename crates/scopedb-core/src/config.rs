//! Storage configuration

use serde::{Deserialize, Serialize};

/// Name of the queue every facade starts with.
pub const DEFAULT_QUEUE: &str = "base";

/// Requests served by one host transaction before it is committed.
pub const DEFAULT_MAX_REQUESTS_PER_TRANSACTION: usize = 256;

/// Configuration for a [`Storage`](crate::Storage) facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database name, used in logs and `Display`
    pub name: String,

    /// Name of the default queue
    pub default_queue: String,

    /// Upper bound on requests sharing one host transaction
    pub max_requests_per_transaction: usize,

    /// Run consecutive compatible queued requests in one transaction
    pub coalesce: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            name: "scopedb".to_string(),
            default_queue: DEFAULT_QUEUE.to_string(),
            max_requests_per_transaction: DEFAULT_MAX_REQUESTS_PER_TRANSACTION,
            coalesce: true,
        }
    }
}

impl StorageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_requests_per_transaction(mut self, max: usize) -> Self {
        self.max_requests_per_transaction = max.max(1);
        self
    }

    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
