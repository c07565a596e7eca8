//! SQLite-backed state database for issues and notification records.
//! One connection, shared by every store of a process.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bem_core::{BemError, FieldValue, Result};
use rusqlite::Connection;
use rusqlite::types::{Value, ValueRef};

/// Handle to the BEM state database. Cloning shares the connection.
#[derive(Clone)]
pub struct BemDb {
    conn: Arc<Mutex<Connection>>,
    writes: Arc<AtomicU64>,
}

impl BemDb {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| store_err("open", e))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| store_err("busy timeout", e))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            writes: Arc::new(AtomicU64::new(0)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            -- One row per correlated problem, keyed by its checksum identity
            CREATE TABLE IF NOT EXISTS bem_issue (
                identity BLOB PRIMARY KEY,
                cell_name TEXT NOT NULL,
                host_name TEXT NOT NULL,
                object_name TEXT NOT NULL DEFAULT '',
                ido_host_name TEXT,              -- monitoring names, before field mapping
                ido_service_name TEXT,
                is_relevant TEXT,                -- 'y' / 'n', NULL while unknown
                severity TEXT,
                worst_severity TEXT,
                attributes TEXT,                 -- JSON object of extracted fields
                ts_first_notification INTEGER,
                ts_last_notification INTEGER,
                ts_next_notification INTEGER,
                notification_count INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_bem_issue_cell ON bem_issue (cell_name);

            -- Append-only log of notifier invocations
            CREATE TABLE IF NOT EXISTS bem_notification (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_identity BLOB NOT NULL,
                cell_name TEXT NOT NULL,
                host_name TEXT NOT NULL,
                object_name TEXT NOT NULL DEFAULT '',
                severity TEXT,
                attributes TEXT,
                command_line TEXT,
                system_user TEXT,
                system_host_name TEXT,
                pid INTEGER,
                ts_notification INTEGER,
                duration_ms INTEGER,
                exit_code INTEGER,
                output TEXT,
                bem_event_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_bem_notification_issue
                ON bem_notification (issue_identity);
         ",
            )
            .map_err(|e| store_err("migration", e))?;

        self.add_missing_columns(
            "bem_issue",
            &[("ido_host_name", "TEXT"), ("ido_service_name", "TEXT")],
        )
    }

    /// Columns added after the first release of a table.
    fn add_missing_columns(&self, table: &str, columns: &[(&str, &str)]) -> Result<()> {
        let conn = self.lock()?;
        for (column, decl) in columns {
            let present: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                    [table, column],
                    |row| row.get(0),
                )
                .map_err(|e| store_err("inspect columns", e))?;
            if present == 0 {
                tracing::info!("adding column {table}.{column}");
                conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
                    .map_err(|e| store_err("add column", e))?;
            }
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BemError::Store("state database lock poisoned".into()))
    }

    pub(crate) fn note_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of successful insert/update/delete statements so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

pub(crate) fn store_err(what: &str, e: rusqlite::Error) -> BemError {
    BemError::Store(format!("{what}: {e}"))
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub(crate) fn to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Int(v) => Value::Integer(*v),
        FieldValue::Text(s) => Value::Text(s.clone()),
        FieldValue::Blob(b) => Value::Blob(b.clone()),
    }
}

pub(crate) fn from_sql(value: ValueRef<'_>) -> FieldValue {
    match value {
        ValueRef::Null => FieldValue::Null,
        ValueRef::Integer(v) => FieldValue::Int(v),
        ValueRef::Real(v) => FieldValue::Int(v as i64),
        ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => FieldValue::Blob(b.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("bem.db");
        let db = BemDb::open(&path).unwrap();
        let tables: i64 = db
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'bem_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
        assert_eq!(db.write_count(), 0);

        // Reopening runs the migration again without complaint.
        drop(db);
        BemDb::open(&path).unwrap();
    }

    #[test]
    fn test_migrate_adds_monitoring_name_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bem.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE bem_issue (
                    identity BLOB PRIMARY KEY,
                    cell_name TEXT NOT NULL,
                    host_name TEXT NOT NULL,
                    object_name TEXT NOT NULL DEFAULT '',
                    is_relevant TEXT,
                    severity TEXT,
                    worst_severity TEXT,
                    attributes TEXT,
                    ts_first_notification INTEGER,
                    ts_last_notification INTEGER,
                    ts_next_notification INTEGER,
                    notification_count INTEGER
                );",
            )
            .unwrap();

        let db = BemDb::open(&path).unwrap();
        let added: i64 = db
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('bem_issue')
                 WHERE name IN ('ido_host_name', 'ido_service_name')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(added, 2);
    }

    #[test]
    fn test_value_mapping() {
        assert_eq!(to_sql(&FieldValue::Int(3)), Value::Integer(3));
        assert_eq!(from_sql(ValueRef::Text(b"y")), FieldValue::from("y"));
        assert_eq!(from_sql(ValueRef::Null), FieldValue::Null);
        assert_eq!(
            from_sql(ValueRef::Blob(&[1, 2])),
            FieldValue::Blob(vec![1, 2])
        );
    }
}
