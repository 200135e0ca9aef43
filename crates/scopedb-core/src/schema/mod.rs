//! Schema model: stores, key paths and indexes
//!
//! Pure data plus the functions that map a structured record onto a
//! backend's native shape. No I/O happens here.
//!
//! # Example
//!
//! ```rust
//! use scopedb_core::schema::{DataType, DatabaseSchema, IndexSchema, StoreSchema};
//! use serde_json::json;
//!
//! let schema = DatabaseSchema::new(1).with_store(
//!     StoreSchema::new("users", "id").with_index(IndexSchema::new("age").typed(DataType::Integer)),
//! );
//!
//! let users = schema.store("users").unwrap();
//! let projected = users.project_indexed_values(&json!({"id": "u1", "age": "30", "extra": "x"}));
//! assert_eq!(projected.key, Some(json!("u1")));
//! assert_eq!(projected.payload, r#"{"extra":"x"}"#);
//! ```

mod coerce;
mod database;
mod error;
mod store;

pub use coerce::{coerce, ColumnValue};
pub use database::{DatabaseSchema, DEFAULT_SIZE};
pub use error::SchemaError;
pub use store::{quote_identifier, DataType, IndexSchema, IndexedValues, StoreSchema};

/// Column holding the JSON encoding of every non-indexed field.
pub const OPAQUE_COLUMN: &str = "_default_";
