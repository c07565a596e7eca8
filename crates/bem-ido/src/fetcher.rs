//! IDO state fetcher.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bem_core::problem::HARD_STATE_PENDING;
use bem_core::{BemError, MonitoringProblemRow, ObjectType, Result, StateType};
use rusqlite::{Connection, OpenFlags, Row};

/// Problem rows keyed by IDO object id.
pub type ProblemSet = BTreeMap<i64, MonitoringProblemRow>;

const SELECT_HOSTS: &str = "
    SELECT
        ho.object_id,
        'host',
        NULL,
        ho.name1,
        NULL,
        hs.state_type,
        CASE hs.current_state WHEN 0 THEN 'UP' WHEN 2 THEN 'UNREACHABLE' ELSE 'DOWN' END,
        CASE WHEN hs.has_been_checked = 0 OR hs.has_been_checked IS NULL THEN ?1
             WHEN hs.state_type = 1 THEN hs.current_state
             ELSE hs.last_hard_state END,
        hs.problem_has_been_acknowledged,
        CASE WHEN hs.scheduled_downtime_depth = 0 THEN 0 ELSE 1 END,
        COALESCE(hs.output, '')
    FROM icinga_objects ho
    JOIN icinga_hoststatus hs ON ho.object_id = hs.host_object_id AND ho.is_active = 1";

const SELECT_SERVICES: &str = "
    SELECT
        so.object_id,
        'service',
        s.host_object_id,
        so.name1,
        so.name2,
        ss.state_type,
        CASE ss.current_state WHEN 0 THEN 'OK' WHEN 1 THEN 'WARNING' WHEN 2 THEN 'CRITICAL'
             ELSE 'UNKNOWN' END,
        CASE WHEN ss.has_been_checked = 0 OR ss.has_been_checked IS NULL THEN ?1
             WHEN ss.state_type = 1 THEN ss.current_state
             ELSE ss.last_hard_state END,
        ss.problem_has_been_acknowledged,
        CASE WHEN ss.scheduled_downtime_depth = 0 THEN 0 ELSE 1 END,
        COALESCE(ss.output, '')
    FROM icinga_objects so
    JOIN icinga_servicestatus ss ON so.object_id = ss.service_object_id AND so.is_active = 1
    JOIN icinga_services s ON s.service_object_id = ss.service_object_id
    JOIN icinga_hoststatus hs ON hs.host_object_id = s.host_object_id";

const PROBLEM_HOSTS: &str = "
    WHERE hs.current_state > 0
      AND hs.state_type = 1
      AND hs.scheduled_downtime_depth = 0
      AND hs.problem_has_been_acknowledged = 0";

const PROBLEM_SERVICES: &str = "
    WHERE hs.current_state = 0
      AND ss.state_type = 1
      AND ss.current_state > 0
      AND ss.scheduled_downtime_depth = 0
      AND ss.problem_has_been_acknowledged = 0";

const VARS_FOR_OBJECTS: &str = "
    SELECT cv.object_id, cv.varname, cv.varvalue
    FROM icinga_customvariablestatus cv
    WHERE cv.object_id IN (SELECT value FROM json_each(?1))";

/// Small IDO access layer. Read-only; owns its connection.
pub struct IdoDb {
    conn: Mutex<Connection>,
    queries: AtomicU64,
}

impl IdoDb {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            queries: AtomicU64::new(0),
        }
    }

    /// Open an IDO database file read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| BemError::Ido(format!("open {}: {e}", path.display())))?;
        Ok(Self::new(conn))
    }

    /// Number of statements executed so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| BemError::Ido(format!("connection lock poisoned: {e}")))
    }

    /// Current hard problems, enriched with custom variables.
    pub fn fetch_problems(&self) -> Result<ProblemSet> {
        let conn = self.lock()?;
        let mut rows = ProblemSet::new();

        for row in self.select_rows(&conn, &format!("{SELECT_HOSTS}{PROBLEM_HOSTS}"), &[])? {
            if let Some(id) = row.id {
                rows.insert(id, row);
            }
        }
        for row in self.select_rows(&conn, &format!("{SELECT_SERVICES}{PROBLEM_SERVICES}"), &[])? {
            if let Some(id) = row.id {
                rows.insert(id, row);
            }
        }

        self.enrich_rows_with_vars(&conn, &mut rows);
        tracing::debug!("🔎 IDO returned {} problem objects", rows.len());
        Ok(rows)
    }

    /// State of one object, or `None` when it does not exist (anymore).
    pub fn get_state_row_for(
        &self,
        host: &str,
        service: Option<&str>,
    ) -> Result<Option<MonitoringProblemRow>> {
        let conn = self.lock()?;
        let mut found = match service {
            None => self.select_rows(
                &conn,
                &format!("{SELECT_HOSTS} WHERE ho.name1 = ?2"),
                &[host],
            )?,
            Some(service) => self.select_rows(
                &conn,
                &format!("{SELECT_SERVICES} WHERE so.name1 = ?2 AND so.name2 = ?3"),
                &[host, service],
            )?,
        };

        let Some(mut row) = found.pop() else {
            return Ok(None);
        };
        self.enrich_row_with_vars(&conn, &mut row);
        Ok(Some(row))
    }

    /// A synthetic healthy row for an object that no longer exists.
    pub fn get_empty_state_row_for(&self, host: &str, service: Option<&str>) -> MonitoringProblemRow {
        let (object_type, state, output) = match service {
            None => (ObjectType::Host, "UP", format!("{host} no longer exists")),
            Some(service) => (
                ObjectType::Service,
                "OK",
                format!("{service} no longer exists on {host}"),
            ),
        };

        MonitoringProblemRow {
            id: None,
            object_type,
            host_id: None,
            host_name: host.to_string(),
            service_name: service.map(str::to_string),
            state_type: StateType::Soft,
            state: state.to_string(),
            hard_state: 0,
            is_acknowledged: false,
            is_in_downtime: false,
            output,
            vars: BTreeMap::new(),
            vars_complete: true,
        }
    }

    fn select_rows(
        &self,
        conn: &Connection,
        sql: &str,
        names: &[&str],
    ) -> Result<Vec<MonitoringProblemRow>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| BemError::Ido(format!("prepare state query: {e}")))?;

        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&HARD_STATE_PENDING];
        params.extend(names.iter().map(|n| n as &dyn rusqlite::ToSql));

        let rows = stmt
            .query_map(params.as_slice(), state_row)
            .map_err(|e| BemError::Ido(format!("state query: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| BemError::Ido(format!("state row: {e}")))
    }

    /// `(object_id, varname, varvalue)` for all given objects in one query.
    fn fetch_vars(&self, conn: &Connection, ids: &[i64]) -> Result<Vec<(i64, String, String)>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let ids = serde_json::to_string(ids)?;
        let mut stmt = conn
            .prepare(VARS_FOR_OBJECTS)
            .map_err(|e| BemError::Enrichment(e.to_string()))?;
        let rows = stmt
            .query_map([ids], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                ))
            })
            .map_err(|e| BemError::Enrichment(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| BemError::Enrichment(e.to_string()))
    }

    fn enrich_rows_with_vars(&self, conn: &Connection, rows: &mut ProblemSet) {
        if rows.is_empty() {
            return;
        }

        // Owning host id -> service object ids
        let mut service_host_ids: HashMap<i64, Vec<i64>> = HashMap::new();
        for (id, row) in rows.iter() {
            if let Some(host_id) = row.host_id {
                service_host_ids.entry(host_id).or_default().push(*id);
            }
        }

        let ids: Vec<i64> = rows.keys().copied().collect();
        match self.fetch_vars(conn, &ids) {
            Ok(vars) => {
                for (object_id, name, value) in vars {
                    if let Some(row) = rows.get_mut(&object_id) {
                        let key = format!("{}{name}", row.object_type.vars_prefix());
                        row.vars.insert(key, value);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Custom variable enrichment failed, rows stay bare: {e}");
                rows.values_mut().for_each(|r| r.vars_complete = false);
                return;
            }
        }

        if service_host_ids.is_empty() {
            return;
        }

        let host_ids: Vec<i64> = service_host_ids.keys().copied().collect();
        match self.fetch_vars(conn, &host_ids) {
            Ok(vars) => {
                for (host_id, name, value) in vars {
                    let key = format!("host.vars.{name}");
                    for id in service_host_ids.get(&host_id).into_iter().flatten() {
                        if let Some(row) = rows.get_mut(id) {
                            row.vars.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Host variable enrichment for services failed: {e}");
                for ids in service_host_ids.values() {
                    for id in ids {
                        if let Some(row) = rows.get_mut(id) {
                            row.vars_complete = false;
                        }
                    }
                }
            }
        }
    }

    fn enrich_row_with_vars(&self, conn: &Connection, row: &mut MonitoringProblemRow) {
        let Some(id) = row.id else {
            return;
        };

        let mut sources = vec![(id, row.object_type.vars_prefix())];
        if let Some(host_id) = row.host_id {
            sources.push((host_id, "host.vars."));
        }

        for (object_id, prefix) in sources {
            match self.fetch_vars(conn, &[object_id]) {
                Ok(vars) => {
                    for (_, name, value) in vars {
                        row.vars.insert(format!("{prefix}{name}"), value);
                    }
                }
                Err(e) => {
                    tracing::warn!("⚠️ Variable lookup for object {object_id} failed: {e}");
                    row.vars_complete = false;
                }
            }
        }
    }
}

fn state_row(row: &Row<'_>) -> rusqlite::Result<MonitoringProblemRow> {
    let object_type = match row.get::<_, String>(1)?.as_str() {
        "service" => ObjectType::Service,
        _ => ObjectType::Host,
    };
    let state_type = match row.get::<_, Option<i64>>(5)? {
        Some(1) => StateType::Hard,
        _ => StateType::Soft,
    };

    Ok(MonitoringProblemRow {
        id: row.get(0)?,
        object_type,
        host_id: row.get(2)?,
        host_name: row.get(3)?,
        service_name: row.get(4)?,
        state_type,
        state: row.get(6)?,
        hard_state: row.get::<_, Option<i64>>(7)?.unwrap_or(HARD_STATE_PENDING),
        is_acknowledged: row.get::<_, Option<i64>>(8)?.unwrap_or(0) != 0,
        is_in_downtime: row.get::<_, i64>(9)? != 0,
        output: row.get(10)?,
        vars: BTreeMap::new(),
        vars_complete: true,
    })
}
