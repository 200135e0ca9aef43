//! Backend drivers
//!
//! The [`Backend`] trait is the seam between the scheduler and a concrete
//! store. Implementations exist for:
//!
//! - **Memory**: snapshot-per-transaction storage for tests (`MemoryBackend`)
//! - **SQLite**: native SQLite via rusqlite (`scopedb-sqlite` crate)
//!
//! # Example
//!
//! ```rust
//! use scopedb_core::schema::{DatabaseSchema, StoreSchema};
//! use scopedb_core::storage::MemoryBackend;
//! use scopedb_core::{CrudService, Storage, StorageConfig};
//! use serde_json::json;
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let schema = DatabaseSchema::new(1).with_store(StoreSchema::new("users", "id"));
//!     let storage = Storage::open(StorageConfig::default(), schema, MemoryBackend::new())
//!         .await
//!         .unwrap();
//!
//!     storage.put("users", json!({"id": "u1", "name": "Ann"})).await.unwrap();
//!     let user = storage.get("users", "u1").await.unwrap();
//!     assert_eq!(user, Some(json!({"id": "u1", "name": "Ann"})));
//! });
//! ```

mod error;
mod memory;
mod traits;

pub use error::{BackendError, BackendResult};
pub use memory::{Fault, MemoryBackend, MemoryTx};
pub use traits::{Backend, Capabilities, Operation, Outcome};
