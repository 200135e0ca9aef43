//! scopedb core engine
//!
//! Schedules scoped CRUD requests onto a single storage connection that can
//! hold one atomic transaction at a time. Requests sharing a scope run in
//! program order, compatible requests share a transaction, and work issued
//! from inside an open transaction joins it instead of queueing behind it.
//!
//! # Example
//!
//! ```rust
//! use scopedb_core::schema::{DatabaseSchema, IndexSchema, StoreSchema};
//! use scopedb_core::storage::MemoryBackend;
//! use scopedb_core::{CrudService, Query, Storage, StorageConfig, TransactionMode};
//! use serde_json::json;
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let schema = DatabaseSchema::new(1)
//!         .with_store(StoreSchema::new("users", "id").with_index(IndexSchema::new("email").unique()))
//!         .with_store(StoreSchema::new("audit", "seq").with_auto_increment());
//!     let storage = Storage::open(StorageConfig::new("app"), schema, MemoryBackend::new())
//!         .await
//!         .unwrap();
//!
//!     // both writes commit or neither does
//!     storage
//!         .transaction(["users", "audit"], TransactionMode::ReadWrite, |session| async move {
//!             session.put("users", json!({"id": "u1", "email": "ann@example.com"})).await?;
//!             session.add("audit", json!({"event": "signup", "user": "u1"})).await
//!         })
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(storage.count("audit", Query::All).await.unwrap(), 1);
//! });
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod key;
pub mod query;
pub mod schema;
pub mod service;
pub mod storage;
pub mod tracing;
pub mod tx;

// Re-export main types at crate root
pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use facade::Storage;
pub use key::{Key, KeyRange};
pub use query::{Cursor, Direction, Query};
pub use service::CrudService;
pub use storage::{Backend, BackendError, Capabilities, MemoryBackend};
pub use tx::{Deferred, Scope, Session, TerminalKind, TransactionMode, TxQueue};
