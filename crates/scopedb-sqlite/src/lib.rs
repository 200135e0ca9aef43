//! SQLite storage backend for scopedb
//!
//! This crate provides a persistent SQLite implementation of the scopedb-core
//! [`Backend`](scopedb_core::Backend) trait, so the same transaction scheduler
//! can run against an in-memory store in tests and a file on disk in
//! production.
//!
//! # Features
//!
//! - One table per store, created and extended from the database schema
//! - Secondary indexes as typed columns, with `UNIQUE` enforcement
//! - Cursor queries with direction, offset and limit
//! - Raw SQL through `execute_sql`
//!
//! # Example
//!
//! ```rust,no_run
//! use scopedb_core::schema::{DatabaseSchema, IndexSchema, StoreSchema};
//! use scopedb_core::{CrudService, Storage, StorageConfig};
//! use scopedb_sqlite::SqliteBackend;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = DatabaseSchema::new(1)
//!     .with_store(StoreSchema::new("users", "id").with_index(IndexSchema::new("email").unique()));
//! let backend = SqliteBackend::open("app.db")?;
//! let storage = Storage::open(StorageConfig::new("app"), schema, backend).await?;
//!
//! storage.put("users", json!({"id": "u1", "email": "ann@example.com"})).await?;
//! let rows = storage
//!     .execute_sql("users", "SELECT id FROM users WHERE email = ?", vec![json!("ann@example.com")])
//!     .await?;
//! assert_eq!(rows, vec![json!({"id": "u1"})]);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod json;
pub mod migrate;
pub mod sql;
pub mod store;

// Re-export main types
pub use error::{Result, SqliteError};
pub use store::{SqliteBackend, SqliteTx};
