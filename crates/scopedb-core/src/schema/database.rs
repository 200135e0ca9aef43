//! Database schema: the ordered set of stores behind one connection

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::error::SchemaError;
use super::store::StoreSchema;

/// Default size hint, 5 MiB.
pub const DEFAULT_SIZE: u64 = 5 * 1024 * 1024;

fn default_size() -> u64 {
    DEFAULT_SIZE
}

/// Static description of every store reachable through one connection.
///
/// Built append-only before the storage facade opens, then shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    version: u32,
    #[serde(default = "default_size")]
    size: u64,
    #[serde(default)]
    stores: Vec<StoreSchema>,
}

impl DatabaseSchema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            size: DEFAULT_SIZE,
            stores: Vec::new(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_store(mut self, store: StoreSchema) -> Self {
        self.stores.push(store);
        self
    }

    pub fn add_store(&mut self, store: StoreSchema) {
        self.stores.push(store);
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn stores(&self) -> &[StoreSchema] {
        &self.stores
    }

    pub fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|store| store.name() == name)
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.store(name).is_some()
    }

    pub fn store_names(&self) -> Vec<&str> {
        self.stores.iter().map(StoreSchema::name).collect()
    }

    /// Reject empty names and duplicate store or index names.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for store in &self.stores {
            if store.name().is_empty() {
                return Err(SchemaError::EmptyName("store name".into()));
            }
            if store.key_segments().any(str::is_empty) {
                return Err(SchemaError::EmptyName(format!(
                    "key path segment in store '{}'",
                    store.name()
                )));
            }
            if !seen.insert(store.name()) {
                return Err(SchemaError::DuplicateStore(store.name().to_string()));
            }

            let mut indexes = HashSet::new();
            for index in store.indexes() {
                if index.name.is_empty() {
                    return Err(SchemaError::EmptyName(format!(
                        "index name in store '{}'",
                        store.name()
                    )));
                }
                if !indexes.insert(index.name.as_str()) {
                    return Err(SchemaError::DuplicateIndex {
                        store: store.name().to_string(),
                        index: index.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Encode to the JSON wire format.
    pub fn to_json(&self) -> Result<String, SchemaError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire format and validate.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let schema: Self = serde_json::from_str(json)?;
        schema.validate()?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, IndexSchema};
    use pretty_assertions::assert_eq;

    fn sample() -> DatabaseSchema {
        DatabaseSchema::new(3)
            .with_size(1024)
            .with_store(
                StoreSchema::new("users", "id")
                    .with_index(IndexSchema::new("email").unique())
                    .with_index(IndexSchema::new("age").typed(DataType::Integer)),
            )
            .with_store(
                StoreSchema::new("events", "meta.seq")
                    .with_auto_increment()
                    .with_index(IndexSchema::new("weight").typed(DataType::Float)),
            )
            .with_store(StoreSchema::new("blobs", ""))
    }

    #[test]
    fn test_round_trip() {
        let schema = sample();
        let decoded = DatabaseSchema::from_json(&schema.to_json().unwrap()).unwrap();
        assert_eq!(decoded, schema);
        assert_eq!(decoded.store_names(), vec!["users", "events", "blobs"]);
        assert_eq!(decoded.stores()[0].columns(), vec!["email", "age"]);
        assert_eq!(decoded.stores()[2].key_path(), "id");
    }

    #[test]
    fn test_wire_format() {
        let json: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["version"], 3);
        assert_eq!(json["size"], 1024);
        assert_eq!(json["stores"][1]["keyPath"], "meta.seq");
        assert_eq!(json["stores"][1]["autoIncrement"], true);
        assert_eq!(json["stores"][1]["indexes"][0]["type"], "REAL");
        assert_eq!(json["stores"][0]["indexes"][0]["unique"], true);
    }

    #[test]
    fn test_decode_defaults() {
        let schema = DatabaseSchema::from_json(
            r#"{"version":1,"stores":[{"name":"s","indexes":[{"name":"n"}]}]}"#,
        )
        .unwrap();
        assert_eq!(schema.size(), DEFAULT_SIZE);
        let store = schema.store("s").unwrap();
        assert_eq!(store.key_path(), "id");
        assert!(!store.is_auto_increment());
        assert_eq!(store.indexes()[0].data_type, DataType::Text);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dup_store = DatabaseSchema::new(1)
            .with_store(StoreSchema::new("a", "id"))
            .with_store(StoreSchema::new("a", "id"));
        assert!(matches!(dup_store.validate(), Err(SchemaError::DuplicateStore(_))));

        let dup_index = DatabaseSchema::new(1).with_store(
            StoreSchema::new("a", "id")
                .with_index(IndexSchema::new("x"))
                .with_index(IndexSchema::new("x").unique()),
        );
        assert!(matches!(dup_index.validate(), Err(SchemaError::DuplicateIndex { .. })));
    }

    #[test]
    fn test_empty_key_segment_rejected() {
        let schema = DatabaseSchema::new(1).with_store(StoreSchema::new("a", "x..y"));
        assert!(matches!(schema.validate(), Err(SchemaError::EmptyName(_))));
    }

    #[test]
    fn test_lookup() {
        let schema = sample();
        assert!(schema.has_store("events"));
        assert!(!schema.has_store("nope"));
        assert!(schema.store("users").unwrap().index("email").unwrap().unique);
    }
}
