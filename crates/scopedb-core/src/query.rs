//! Query parameter for read and clear operations

use crate::key::{Key, KeyRange};
use crate::schema::StoreSchema;

/// Iteration direction of a cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Next,
    Prev,
}

/// Cursor-style iteration over the primary key or an index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cursor {
    pub index: Option<String>,
    pub range: KeyRange,
    pub direction: Direction,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = range;
        self
    }

    pub fn reverse(mut self) -> Self {
        self.direction = Direction::Prev;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Apply offset and limit to an already ordered sequence.
    pub fn window<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let items = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => items.take(limit).collect(),
            None => items.collect(),
        }
    }
}

/// Which records of a store an operation addresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Query {
    #[default]
    All,
    Key(Key),
    Range(KeyRange),
    /// Records whose index field falls in `range`
    Index { name: String, range: KeyRange },
    Cursor(Cursor),
}

impl Query {
    pub fn index(name: impl Into<String>, range: KeyRange) -> Self {
        Query::Index {
            name: name.into(),
            range,
        }
    }

    pub fn is_cursor(&self) -> bool {
        matches!(self, Query::Cursor(_))
    }

    /// Index the query walks, if it names one other than the key path.
    pub fn index_name(&self) -> Option<&str> {
        match self {
            Query::Index { name, .. } => Some(name),
            Query::Cursor(cursor) => cursor.index.as_deref(),
            _ => None,
        }
    }

    /// Check index names against `store` and reject inverted ranges.
    pub fn validate(&self, store: &StoreSchema) -> Result<(), String> {
        if let Some(name) = self.index_name() {
            if !store.has_index(name) {
                return Err(format!("store '{}' has no index '{}'", store.name(), name));
            }
        }
        let range = match self {
            Query::Range(range) | Query::Index { range, .. } => Some(range),
            Query::Cursor(cursor) => Some(&cursor.range),
            _ => None,
        };
        match range {
            Some(range) if !range.is_valid() => {
                Err(format!("empty key range on store '{}'", store.name()))
            }
            _ => Ok(()),
        }
    }
}

impl From<Key> for Query {
    fn from(key: Key) -> Self {
        Query::Key(key)
    }
}

impl From<&str> for Query {
    fn from(key: &str) -> Self {
        Query::Key(Key::from(key))
    }
}

impl From<i64> for Query {
    fn from(key: i64) -> Self {
        Query::Key(Key::from(key))
    }
}

impl From<KeyRange> for Query {
    fn from(range: KeyRange) -> Self {
        Query::Range(range)
    }
}

impl From<Cursor> for Query {
    fn from(cursor: Cursor) -> Self {
        Query::Cursor(cursor)
    }
}
