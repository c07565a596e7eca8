//! Seeder for a minimal IDO schema copy in a temporary SQLite file.

use std::cell::Cell;
use std::path::PathBuf;

use bem_core::{BemError, Result};
use rusqlite::Connection;

use crate::fetcher::IdoDb;

const IDO_SCHEMA: &str = "
    CREATE TABLE icinga_objects (
        object_id INTEGER PRIMARY KEY,
        objecttype_id INTEGER NOT NULL,   -- 1 host, 2 service
        name1 TEXT NOT NULL,
        name2 TEXT,
        is_active INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE icinga_hoststatus (
        host_object_id INTEGER PRIMARY KEY,
        current_state INTEGER NOT NULL DEFAULT 0,
        last_hard_state INTEGER NOT NULL DEFAULT 0,
        state_type INTEGER NOT NULL DEFAULT 1,
        has_been_checked INTEGER DEFAULT 1,
        scheduled_downtime_depth INTEGER NOT NULL DEFAULT 0,
        problem_has_been_acknowledged INTEGER NOT NULL DEFAULT 0,
        output TEXT
    );
    CREATE TABLE icinga_servicestatus (
        service_object_id INTEGER PRIMARY KEY,
        current_state INTEGER NOT NULL DEFAULT 0,
        last_hard_state INTEGER NOT NULL DEFAULT 0,
        state_type INTEGER NOT NULL DEFAULT 1,
        has_been_checked INTEGER DEFAULT 1,
        scheduled_downtime_depth INTEGER NOT NULL DEFAULT 0,
        problem_has_been_acknowledged INTEGER NOT NULL DEFAULT 0,
        output TEXT
    );
    CREATE TABLE icinga_services (
        service_object_id INTEGER PRIMARY KEY,
        host_object_id INTEGER NOT NULL
    );
    CREATE TABLE icinga_customvariablestatus (
        object_id INTEGER NOT NULL,
        varname TEXT NOT NULL,
        varvalue TEXT,
        PRIMARY KEY (object_id, varname)
    );
";

/// A writable IDO copy. Objects are created hard, checked, unacknowledged
/// and outside downtime; tweak them with [`IdoFixture::execute`].
pub struct IdoFixture {
    _dir: tempfile::TempDir,
    path: PathBuf,
    conn: Connection,
    next_id: Cell<i64>,
}

impl IdoFixture {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ido.db");
        let conn = Connection::open(&path).map_err(ido_err)?;
        conn.execute_batch(IDO_SCHEMA).map_err(ido_err)?;
        Ok(Self {
            _dir: dir,
            path,
            conn,
            next_id: Cell::new(1),
        })
    }

    fn next_id(&self) -> i64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// A read-only [`IdoDb`] on this copy.
    pub fn open_ido(&self) -> Result<IdoDb> {
        IdoDb::open(&self.path)
    }

    pub fn host(&self, name: &str, state: i64) -> Result<i64> {
        let id = self.next_id();
        self.conn.execute(
            "INSERT INTO icinga_objects (object_id, objecttype_id, name1) VALUES (?1, 1, ?2)",
            rusqlite::params![id, name],
        )
        .map_err(ido_err)?;
        self.conn.execute(
            "INSERT INTO icinga_hoststatus (host_object_id, current_state, last_hard_state, output)
             VALUES (?1, ?2, ?2, ?3)",
            rusqlite::params![id, state, format!("host {name} state {state}")],
        )
        .map_err(ido_err)?;
        Ok(id)
    }

    pub fn service(&self, host_id: i64, host: &str, name: &str, state: i64) -> Result<i64> {
        let id = self.next_id();
        self.conn.execute(
            "INSERT INTO icinga_objects (object_id, objecttype_id, name1, name2) VALUES (?1, 2, ?2, ?3)",
            rusqlite::params![id, host, name],
        )
        .map_err(ido_err)?;
        self.conn.execute(
            "INSERT INTO icinga_servicestatus (service_object_id, current_state, last_hard_state, output)
             VALUES (?1, ?2, ?2, ?3)",
            rusqlite::params![id, state, format!("{name} on {host} state {state}")],
        )
        .map_err(ido_err)?;
        self.conn.execute(
            "INSERT INTO icinga_services (service_object_id, host_object_id) VALUES (?1, ?2)",
            rusqlite::params![id, host_id],
        )
        .map_err(ido_err)?;
        Ok(id)
    }

    pub fn var(&self, object_id: i64, name: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO icinga_customvariablestatus (object_id, varname, varvalue)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![object_id, name, value],
        )
        .map_err(ido_err)?;
        Ok(())
    }

    /// Run a statement taking a single object id parameter.
    pub fn execute(&self, sql: &str, object_id: i64) -> Result<usize> {
        self.conn.execute(sql, [object_id]).map_err(ido_err)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).map_err(ido_err)
    }
}

fn ido_err(e: rusqlite::Error) -> BemError {
    BemError::Ido(e.to_string())
}
