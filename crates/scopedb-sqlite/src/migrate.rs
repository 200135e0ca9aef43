//! Schema migration runner
//!
//! Each store becomes a table with the key path as primary key, one column
//! per index and the opaque `_default_` column for everything else. Applied
//! schema versions are recorded in `schema_migrations`, so reopening a file
//! with the same schema is a no-op and a newer schema only adds what is
//! missing. Columns and tables are never dropped.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use scopedb_core::schema::{quote_identifier, DatabaseSchema, IndexSchema, StoreSchema, OPAQUE_COLUMN};

use crate::error::{Result, SqliteError};

const CREATE_SCHEMA_MIGRATIONS: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    schema TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// Index columns of `store` in table order. The key path and the opaque
/// column are excluded.
pub fn index_columns(store: &StoreSchema) -> Vec<&IndexSchema> {
    store
        .indexes()
        .iter()
        .filter(|index| index.name != OPAQUE_COLUMN && index.name != store.key_path())
        .collect()
}

/// Apply `schema` to the database unless this exact schema was applied before.
///
/// # Errors
///
/// Returns an error if any statement fails; the migration is rolled back.
pub fn migrate(conn: &Connection, schema: &DatabaseSchema) -> Result<()> {
    conn.execute(CREATE_SCHEMA_MIGRATIONS, [])?;

    let encoded = schema
        .to_json()
        .map_err(|err| SqliteError::Migration(err.to_string()))?;
    if is_migration_applied(conn, schema.version(), &encoded)? {
        debug!("schema version {} already applied", schema.version());
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    for store in schema.stores() {
        apply_store(&tx, store)?;
    }
    record_migration(&tx, schema.version(), &encoded)?;
    tx.commit()?;

    info!(
        "applied schema version {} ({} store(s))",
        schema.version(),
        schema.stores().len()
    );
    Ok(())
}

/// Latest schema recorded in the database, if any.
pub fn stored_schema(conn: &Connection) -> Result<Option<DatabaseSchema>> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(None);
    }
    let encoded: Option<String> = conn
        .query_row(
            "SELECT schema FROM schema_migrations ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    encoded
        .map(|json| DatabaseSchema::from_json(&json).map_err(|err| SqliteError::Migration(err.to_string())))
        .transpose()
}

fn apply_store(conn: &Connection, store: &StoreSchema) -> Result<()> {
    let table = store.quoted_name();
    let indexes = index_columns(store);

    if table_exists(conn, store.name())? {
        let existing = table_columns(conn, store.name())?;
        for index in &indexes {
            if !existing.iter().any(|column| column == &index.name) {
                debug!("adding column '{}' to '{}'", index.name, store.name());
                conn.execute(
                    &format!(
                        "ALTER TABLE {table} ADD COLUMN {} {}",
                        quote_identifier(&index.name),
                        index.data_type.as_sql()
                    ),
                    [],
                )?;
            }
        }
    } else {
        // Untyped key column keeps SQLite's cross-type ordering: numbers before text.
        let key = if store.is_auto_increment() {
            format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", store.quoted_key_path())
        } else {
            format!("{} PRIMARY KEY NOT NULL", store.quoted_key_path())
        };
        let mut columns = vec![key];
        columns.extend(
            indexes
                .iter()
                .map(|index| format!("{} {}", quote_identifier(&index.name), index.data_type.as_sql())),
        );
        columns.push(format!("{} TEXT", quote_identifier(OPAQUE_COLUMN)));
        conn.execute(&format!("CREATE TABLE {table} ({})", columns.join(", ")), [])?;
    }

    for index in &indexes {
        let unique = if index.unique { "UNIQUE " } else { "" };
        let name = quote_identifier(&format!("{}-{}", store.name(), index.name));
        conn.execute(
            &format!(
                "CREATE {unique}INDEX IF NOT EXISTS {name} ON {table} ({})",
                quote_identifier(&index.name)
            ),
            [],
        )?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")?
        .exists([name])?)
}

fn table_columns(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(name)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Check if this schema has already been applied
fn is_migration_applied(conn: &Connection, version: u32, encoded: &str) -> Result<bool> {
    let exists = conn
        .prepare("SELECT 1 FROM schema_migrations WHERE version = ? AND schema = ?")?
        .exists(rusqlite::params![version, encoded])?;
    Ok(exists)
}

fn record_migration(conn: &Connection, version: u32, encoded: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, schema, applied_at) VALUES (?, ?, CURRENT_TIMESTAMP)",
        rusqlite::params![version, encoded],
    )?;
    Ok(())
}
