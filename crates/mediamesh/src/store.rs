//! SQLite store shared by every component
//!
//! A single [`Database`] is opened at startup and handed to components as an
//! `Arc<Database>`. It owns the schema; the components own their queries.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS instance (
        singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS api_keys (
        id TEXT PRIMARY KEY,
        label TEXT NOT NULL,
        salt TEXT NOT NULL,
        secret_hash TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        bound_instance_id TEXT
    );

    CREATE TABLE IF NOT EXISTS peers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        api_key TEXT NOT NULL,
        remote_instance_id TEXT UNIQUE,
        last_seen TEXT,
        auto_replicate INTEGER NOT NULL DEFAULT 0,
        sync_library_id TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS transfers (
        peer_id TEXT NOT NULL REFERENCES peers(id) ON DELETE CASCADE,
        remote_item_id TEXT NOT NULL,
        download_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (peer_id, remote_item_id)
    );
";

/// Columns added after the first release, as `(table, column, definition)`
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[("api_keys", "bound_instance_id", "TEXT")];

/// SQLite database holding identity, keys, peers, transfer records and settings
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("failed to open SQLite database: {e}")))?;
        debug!(path = %path.display(), "Database opened");
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage(format!("failed to open in-memory database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::storage(format!("failed to enable foreign keys: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::storage(format!("failed to create tables: {e}")))?;
        for (table, column, definition) in ADDED_COLUMNS {
            add_missing_column(&conn, table, column, definition)
                .map_err(|e| Error::storage(format!("failed to migrate {table}.{column}: {e}")))?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// Every statement issued inside `f` sees no interleaved writes from
    /// other callers.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(Error::from)
    }

    /// Read a setting
    pub fn setting(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    /// Write a setting; `None` deletes it
    pub fn set_setting(&self, key: &str, value: Option<&str>) -> Result<()> {
        self.with_conn(|conn| match value {
            Some(value) => conn
                .execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    [key, value],
                )
                .map(|_| ()),
            None => conn
                .execute("DELETE FROM settings WHERE key = ?1", [key])
                .map(|_| ()),
        })
    }
}

fn add_missing_column(conn: &Connection, table: &str, column: &str, definition: &str) -> rusqlite::Result<()> {
    let present: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    if !present {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
        debug!(table, column, "Added column to existing database");
    }
    Ok(())
}

/// Format a timestamp for storage.
///
/// Fixed precision and a `Z` suffix keep stored values lexically ordered, so
/// freshness comparisons can happen inside SQL.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Parse a stored UUID
pub fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::open(&db_path).unwrap();

        let tables: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                     AND name IN ('instance', 'settings', 'api_keys', 'peers', 'transfers')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(tables, 5);

        // Reopening an existing file is fine
        drop(db);
        Database::open(&db_path).unwrap();
    }

    #[test]
    fn test_open_adds_columns_to_older_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("old.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE api_keys (
                     id TEXT PRIMARY KEY,
                     label TEXT NOT NULL,
                     salt TEXT NOT NULL,
                     secret_hash TEXT NOT NULL UNIQUE,
                     created_at TEXT NOT NULL
                 );
                 INSERT INTO api_keys VALUES ('k', 'old', 's', 'h', '2026-01-01T00:00:00.000000Z');",
            )
            .unwrap();

        let db = Database::open(&db_path).unwrap();
        let bound: Option<String> = db
            .with_conn(|conn| {
                conn.query_row("SELECT bound_instance_id FROM api_keys WHERE id = 'k'", [], |row| {
                    row.get(0)
                })
            })
            .unwrap();
        assert_eq!(bound, None);

        drop(db);
        Database::open(&db_path).unwrap();
    }

    #[test]
    fn test_settings_roundtrip_and_clear() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.setting("external_url").unwrap(), None);

        db.set_setting("external_url", Some("http://1.2.3.4:3000")).unwrap();
        db.set_setting("external_url", Some("http://5.6.7.8:3000")).unwrap();
        assert_eq!(
            db.setting("external_url").unwrap().as_deref(),
            Some("http://5.6.7.8:3000")
        );

        db.set_setting("external_url", None).unwrap();
        assert_eq!(db.setting("external_url").unwrap(), None);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + Duration::milliseconds(1);
        assert!(format_ts(&earlier) < format_ts(&later));

        let parsed = parse_ts(&format_ts(&earlier)).unwrap();
        assert_eq!(format_ts(&parsed), format_ts(&earlier));
    }
}
