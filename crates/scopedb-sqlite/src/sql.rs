//! Translate a [`Query`] into SQL clauses over a store table

use rusqlite::types::Value as SqlValue;

use scopedb_core::schema::{quote_identifier, StoreSchema, OPAQUE_COLUMN};
use scopedb_core::{Direction, KeyRange, Query};

use crate::error::Result;
use crate::json::key_to_sql;
use crate::migrate::index_columns;

/// `WHERE`, `ORDER BY` and `LIMIT` clauses selecting the rows of a query,
/// with their bind parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    table: String,
    filter: Vec<String>,
    order: Vec<String>,
    descending: bool,
    window: String,
    params: Vec<SqlValue>,
}

impl Selection {
    pub fn new(store: &StoreSchema, query: &Query) -> Result<Self> {
        let key = store.quoted_key_path();
        let mut selection = Self {
            table: store.quoted_name(),
            filter: Vec::new(),
            order: vec![key.clone()],
            descending: false,
            window: String::new(),
            params: Vec::new(),
        };

        match query {
            Query::All => {}
            Query::Key(k) => {
                selection.filter.push(format!("{key} = ?"));
                selection.params.push(key_to_sql(k)?);
            }
            Query::Range(range) => selection.bound(&key, range)?,
            Query::Index { name, range } => selection.on_index(store, name, range)?,
            Query::Cursor(cursor) => {
                match cursor.index.as_deref() {
                    Some(name) => selection.on_index(store, name, &cursor.range)?,
                    None => selection.bound(&key, &cursor.range)?,
                }
                selection.descending = cursor.direction == Direction::Prev;
                selection.window = match cursor.limit {
                    Some(limit) => format!(" LIMIT {limit} OFFSET {}", cursor.offset),
                    None if cursor.offset > 0 => format!(" LIMIT -1 OFFSET {}", cursor.offset),
                    None => String::new(),
                };
            }
        }
        Ok(selection)
    }

    fn on_index(&mut self, store: &StoreSchema, name: &str, range: &KeyRange) -> Result<()> {
        if name == store.key_path() {
            return self.bound(&store.quoted_key_path(), range);
        }
        let column = quote_identifier(name);
        self.filter.push(format!("{column} IS NOT NULL"));
        self.order = vec![column.clone(), store.quoted_key_path()];
        self.bound(&column, range)
    }

    fn bound(&mut self, column: &str, range: &KeyRange) -> Result<()> {
        if let Some(lower) = &range.lower {
            let op = if range.lower_open { ">" } else { ">=" };
            self.filter.push(format!("{column} {op} ?"));
            self.params.push(key_to_sql(lower)?);
        }
        if let Some(upper) = &range.upper {
            let op = if range.upper_open { "<" } else { "<=" };
            self.filter.push(format!("{column} {op} ?"));
            self.params.push(key_to_sql(upper)?);
        }
        Ok(())
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// `SELECT columns` over the selected rows, ordered and windowed.
    pub fn select(&self, columns: &str) -> String {
        let filter = if self.filter.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.filter.join(" AND "))
        };
        let direction = if self.descending { "DESC" } else { "ASC" };
        let order = self
            .order
            .iter()
            .map(|column| format!("{column} {direction}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT {columns} FROM {}{filter} ORDER BY {order}{}",
            self.table, self.window
        )
    }
}

/// Column list of a full row: key, index columns, opaque column.
pub fn record_columns(store: &StoreSchema) -> String {
    let mut columns = vec![store.quoted_key_path()];
    columns.extend(index_columns(store).iter().map(|index| quote_identifier(&index.name)));
    columns.push(quote_identifier(OPAQUE_COLUMN));
    columns.join(", ")
}
