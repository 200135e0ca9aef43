//! Store and index schemas, and the record mapping they define

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::coerce::{coerce, ColumnValue};
use super::OPAQUE_COLUMN;
use crate::key::Key;

/// Index column data type. Wire names follow SQLite type names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    #[serde(rename = "TEXT")]
    Text,
    #[serde(rename = "INTEGER")]
    Integer,
    #[serde(rename = "REAL")]
    Float,
}

impl DataType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            DataType::Text => "TEXT",
            DataType::Integer => "INTEGER",
            DataType::Float => "REAL",
        }
    }
}

/// Secondary index on a top-level record field of the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(rename = "type", default)]
    pub data_type: DataType,
}

impl IndexSchema {
    /// Non-unique text index.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique: false,
            data_type: DataType::Text,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn typed(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }
}

fn default_key_path() -> String {
    "id".to_string()
}

/// A named store of records with a key path and secondary indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    name: String,
    #[serde(default = "default_key_path")]
    key_path: String,
    #[serde(default)]
    auto_increment: bool,
    #[serde(default)]
    indexes: Vec<IndexSchema>,
}

/// Output of [`StoreSchema::project_indexed_values`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedValues {
    /// Value at the key path, if present
    pub key: Option<Value>,
    /// `(index name, coerced value)` for each index field present on the record
    pub columns: Vec<(String, ColumnValue)>,
    /// JSON object of every field not covered by the key path or an index
    pub payload: String,
}

impl IndexedValues {
    /// Column names in projection order: key path, indexes, opaque column.
    pub fn column_names<'a>(&'a self, store: &'a StoreSchema) -> Vec<&'a str> {
        let mut names = Vec::with_capacity(self.columns.len() + 2);
        names.push(store.key_path());
        names.extend(self.columns.iter().map(|(name, _)| name.as_str()));
        names.push(OPAQUE_COLUMN);
        names
    }

    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }
}

impl StoreSchema {
    /// Store keyed by `key_path`; an empty key path falls back to `"id"`.
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        let key_path = key_path.into();
        Self {
            name: name.into(),
            key_path: if key_path.is_empty() {
                default_key_path()
            } else {
                key_path
            },
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    pub fn with_auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment
    }

    pub fn indexes(&self) -> &[IndexSchema] {
        &self.indexes
    }

    pub fn key_segments(&self) -> impl Iterator<Item = &str> {
        self.key_path.split('.')
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }

    /// True if `name` is the key path or a declared index.
    pub fn has_index(&self, name: &str) -> bool {
        name == self.key_path || self.indexes.iter().any(|index| index.name == name)
    }

    /// Index names, used as column names by table-shaped backends.
    pub fn columns(&self) -> Vec<&str> {
        self.indexes.iter().map(|index| index.name.as_str()).collect()
    }

    pub fn quoted_name(&self) -> String {
        quote_identifier(&self.name)
    }

    pub fn quoted_key_path(&self) -> String {
        quote_identifier(&self.key_path)
    }

    /// Walk the key path through nested objects. Any missing segment yields `None`.
    pub fn resolve_key<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        self.key_segments()
            .try_fold(record, |value, segment| value.as_object()?.get(segment))
    }

    /// Resolve the key path and convert it to a [`Key`].
    pub fn key_of(&self, record: &Value) -> Option<Key> {
        self.resolve_key(record).and_then(Key::from_value)
    }

    /// Set `value` at the key path, creating intermediate objects as needed.
    pub fn assign_key(&self, record: &mut Value, value: Value) {
        let segments: Vec<&str> = self.key_segments().collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut target = record;
        for segment in parents {
            target = ensure_object(target)
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(target).insert(last.to_string(), value);
    }

    /// Map a record onto the backend column shape: key, one coerced value per
    /// present index field, and an opaque payload of the remaining fields.
    pub fn project_indexed_values(&self, record: &Value) -> IndexedValues {
        let key = self.resolve_key(record).cloned();

        let columns = self
            .indexes
            .iter()
            .filter(|index| index.name != OPAQUE_COLUMN)
            .filter_map(|index| {
                let field = record.get(&index.name)?;
                Some((index.name.clone(), coerce(field, index.data_type)))
            })
            .collect();

        let mut rest = Map::new();
        if let Some(fields) = record.as_object() {
            for (name, value) in fields {
                if !self.has_index(name) {
                    rest.insert(name.clone(), value.clone());
                }
            }
        }

        IndexedValues {
            key,
            columns,
            payload: Value::Object(rest).to_string(),
        }
    }

    /// Parse delimited text into records: the first line names the fields,
    /// each following non-empty line is one record. Fields backing a numeric
    /// index are stored as numbers when they parse.
    pub fn parse_delimited(&self, text: &str, delimiter: char) -> Vec<Value> {
        let mut lines = text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty());

        let Some(header) = lines.next() else {
            return Vec::new();
        };
        let fields: Vec<&str> = header.split(delimiter).map(str::trim).collect();

        lines
            .map(|line| {
                let mut record = Value::Object(Map::new());
                for (name, raw) in fields.iter().zip(line.split(delimiter)) {
                    let value = self.load_value(name, raw.trim());
                    if *name == self.key_path {
                        self.assign_key(&mut record, value);
                    } else if let Value::Object(map) = &mut record {
                        map.insert(name.to_string(), value);
                    }
                }
                record
            })
            .collect()
    }

    fn load_value(&self, field: &str, raw: &str) -> Value {
        let text = Value::String(raw.to_string());
        match self.index(field).map(|index| index.data_type) {
            Some(data_type @ (DataType::Integer | DataType::Float)) => {
                match coerce(&text, data_type) {
                    value @ (ColumnValue::Integer(_) | ColumnValue::Float(_)) if !value.is_nan() => {
                        value.to_json()
                    }
                    _ => text,
                }
            }
            _ => text,
        }
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn users() -> StoreSchema {
        StoreSchema::new("users", "id").with_index(IndexSchema::new("age").typed(DataType::Integer))
    }

    #[test]
    fn test_resolve_nested_key() {
        let store = StoreSchema::new("feeds", "feed.id.$t");
        let record = json!({"feed": {"id": {"$t": "abc"}}});
        assert_eq!(store.resolve_key(&record), Some(&json!("abc")));
        assert_eq!(store.resolve_key(&json!({"feed": {}})), None);
        assert_eq!(store.resolve_key(&json!({"feed": 3})), None);
        assert_eq!(store.resolve_key(&json!("scalar")), None);
    }

    #[test]
    fn test_assign_then_resolve() {
        let store = StoreSchema::new("s", "a.b");
        let mut record = json!({"x": 1});
        store.assign_key(&mut record, json!("k"));
        assert_eq!(record, json!({"x": 1, "a": {"b": "k"}}));
        assert_eq!(store.resolve_key(&record), Some(&json!("k")));
    }

    #[test]
    fn test_assign_replaces_scalar_intermediate() {
        let store = StoreSchema::new("s", "a.b");
        let mut record = json!({"a": 5});
        store.assign_key(&mut record, json!(1));
        assert_eq!(record, json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_project_indexed_values() {
        let projected = users().project_indexed_values(&json!({"id": "u1", "age": "30", "extra": "x"}));
        assert_eq!(projected.key, Some(json!("u1")));
        assert_eq!(projected.columns, vec![("age".to_string(), ColumnValue::Integer(30))]);
        let payload: Value = serde_json::from_str(&projected.payload).unwrap();
        assert_eq!(payload, json!({"extra": "x"}));
    }

    #[test]
    fn test_project_skips_absent_index_and_keeps_nan() {
        let store = users().with_index(IndexSchema::new("score").typed(DataType::Float));
        let projected = store.project_indexed_values(&json!({"id": 1, "score": "n/a"}));
        assert_eq!(projected.columns.len(), 1);
        assert!(projected.column("score").unwrap().is_nan());
        assert!(projected.column("age").is_none());
        assert_eq!(projected.payload, "{}");
    }

    #[test]
    fn test_project_excludes_opaque_index() {
        let store = users().with_index(IndexSchema::new(OPAQUE_COLUMN));
        let projected = store.project_indexed_values(&json!({"id": 1, OPAQUE_COLUMN: "raw"}));
        assert!(projected.column(OPAQUE_COLUMN).is_none());
        assert_eq!(
            projected.column_names(&store),
            vec!["id", OPAQUE_COLUMN]
        );
    }

    #[test]
    fn test_has_index() {
        let store = users();
        assert!(store.has_index("id"));
        assert!(store.has_index("age"));
        assert!(!store.has_index("name"));
    }

    #[test]
    fn test_parse_delimited() {
        let records = users().parse_delimited("id,age,name\r\nu1,30,Ann\n\nu2,old,Bob\n", ',');
        assert_eq!(
            records,
            vec![
                json!({"id": "u1", "age": 30, "name": "Ann"}),
                json!({"id": "u2", "age": "old", "name": "Bob"}),
            ]
        );
    }

    #[test]
    fn test_quoted_identifiers() {
        let store = StoreSchema::new("we\"ird", "id");
        assert_eq!(store.quoted_name(), "\"we\"\"ird\"");
        assert_eq!(store.quoted_key_path(), "\"id\"");
    }
}
