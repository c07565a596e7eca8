//! Issue store: reconcile problem rows with stored issues and persist
//! only what changed.

use bem_core::{
    BemError, CellConfig, FieldValue, Identity, MonitoringProblemRow, RecordSchema, Result,
};
use rusqlite::params_from_iter;

use crate::issue::{Issue, IssueSchema};
use crate::persistence::{BemDb, from_sql, is_constraint_violation, store_err, to_sql};

#[derive(Clone)]
pub struct IssueStore {
    db: BemDb,
}

impl IssueStore {
    pub fn new(db: BemDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &BemDb {
        &self.db
    }

    fn select_sql(filter: &str) -> String {
        format!(
            "SELECT {} FROM {} {filter}",
            IssueSchema::FIELDS.join(", "),
            IssueSchema::NAME
        )
    }

    fn query(&self, filter: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Issue>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&Self::select_sql(filter))
            .map_err(|e| store_err("prepare select", e))?;
        let rows = stmt
            .query_map(params, |row| {
                let mut values = Vec::with_capacity(IssueSchema::FIELDS.len());
                for (idx, field) in IssueSchema::FIELDS.iter().enumerate() {
                    values.push((field.to_string(), from_sql(row.get_ref(idx)?)));
                }
                Ok(values)
            })
            .map_err(|e| store_err("select issues", e))?;

        let mut issues = Vec::new();
        for values in rows {
            let values = values.map_err(|e| store_err("read issue", e))?;
            issues.push(Issue::from_values(values)?);
        }
        Ok(issues)
    }

    pub fn load_by_identity(&self, identity: &Identity) -> Result<Option<Issue>> {
        let key = identity.as_bytes().to_vec();
        Ok(self
            .query("WHERE identity = ?1", &[&key])?
            .into_iter()
            .next())
    }

    /// Load by names; the identity is computed from them.
    pub fn load(&self, cell: &str, host: &str, object: &str) -> Result<Option<Issue>> {
        self.load_by_identity(&bem_core::compute_identity(cell, host, object))
    }

    pub fn list_for_cell(&self, cell: &str) -> Result<Vec<Issue>> {
        self.query(
            "WHERE cell_name = ?1 ORDER BY host_name, object_name",
            &[&cell],
        )
    }

    pub fn list_all(&self) -> Result<Vec<Issue>> {
        self.query("ORDER BY cell_name, host_name, object_name", &[])
    }

    pub fn count_for_cell(&self, cell: &str) -> Result<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM bem_issue WHERE cell_name = ?1",
                [cell],
                |row| row.get(0),
            )
            .map_err(|e| store_err("count issues", e))?;
        Ok(count as usize)
    }

    /// The issue a problem row maps to: the stored one with the row's values
    /// overlaid, or a new one.
    pub fn reconcile(&self, row: &MonitoringProblemRow, cell: &dyn CellConfig) -> Result<Issue> {
        let mut fresh = Issue::new();
        fresh.set_problem(row, cell)?;
        let identity = fresh.identity()?;

        let Some(mut existing) = self.load_by_identity(&identity)? else {
            return Ok(fresh);
        };

        if existing.computed_identity() != identity {
            return Err(BemError::IdentityConflict(format!(
                "stored issue {identity} belongs to {}!{}!{}",
                existing.cell_name(),
                existing.host_name(),
                existing.object_name()
            )));
        }
        existing.set_problem(row, cell)?;
        Ok(existing)
    }

    /// Persist pending changes. Returns whether anything was written.
    pub fn store(&self, issue: &mut Issue) -> Result<bool> {
        if !issue.has_been_modified() {
            return Ok(false);
        }
        if issue.is_new() {
            self.insert(issue)?;
        } else {
            self.update(issue)?;
        }
        Ok(true)
    }

    fn insert(&self, issue: &mut Issue) -> Result<()> {
        let values: Vec<(&str, &FieldValue)> = issue
            .props()
            .all_fields_for_persistence()
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        let columns: Vec<&str> = values.iter().map(|(f, _)| *f).collect();
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            IssueSchema::NAME,
            columns.join(", "),
            placeholders.join(", ")
        );

        let result = {
            let conn = self.db.lock()?;
            conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| to_sql(v))))
        };

        match result {
            Ok(_) => {
                self.db.note_write();
                issue.mark_stored();
                tracing::debug!("➕ issue {}/{} inserted", issue.host_name(), issue.object_name());
                Ok(())
            }
            Err(e) if is_constraint_violation(&e) => {
                tracing::warn!(
                    "issue {}/{} was inserted concurrently, updating instead",
                    issue.host_name(),
                    issue.object_name()
                );
                self.merge_into_stored(issue)
            }
            Err(e) => Err(store_err("insert issue", e)),
        }
    }

    /// Lost an insert race: apply this record's problem values to the row
    /// that won and adopt that row. On failure `issue` is left untouched.
    fn merge_into_stored(&self, issue: &mut Issue) -> Result<()> {
        let identity = issue.identity()?;
        let Some(mut stored) = self.load_by_identity(&identity)? else {
            return Err(BemError::Store(format!(
                "issue {identity} collided on insert but is gone"
            )));
        };
        stored.absorb_problem(issue)?;
        self.update_modified(&mut stored)?;
        *issue = stored;
        Ok(())
    }

    fn update(&self, issue: &mut Issue) -> Result<()> {
        if issue.props().is_modified("identity")? {
            return Err(BemError::IdentityConflict(format!(
                "refusing to move stored issue {}/{} to a new identity",
                issue.host_name(),
                issue.object_name()
            )));
        }
        self.update_modified(issue)
    }

    fn update_modified(&self, issue: &mut Issue) -> Result<()> {
        let identity = issue.identity()?;
        let values: Vec<(&str, &FieldValue)> = issue
            .props()
            .modified_values()
            .into_iter()
            .filter(|(f, _)| *f != "identity")
            .collect();
        if values.is_empty() {
            issue.mark_stored();
            return Ok(());
        }

        let assignments: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (f, _))| format!("{f} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE identity = ?{}",
            IssueSchema::NAME,
            assignments.join(", "),
            values.len() + 1
        );
        let params = values
            .iter()
            .map(|(_, v)| to_sql(v))
            .chain(std::iter::once(rusqlite::types::Value::Blob(
                identity.as_bytes().to_vec(),
            )));

        let changed = {
            let conn = self.db.lock()?;
            conn.execute(&sql, params_from_iter(params))
                .map_err(|e| store_err("update issue", e))?
        };
        if changed == 0 {
            return Err(BemError::Store(format!(
                "issue {identity} vanished before it could be updated"
            )));
        }
        self.db.note_write();
        issue.mark_stored();
        Ok(())
    }

    /// Close an issue. A later [`IssueStore::store`] re-inserts it.
    pub fn delete(&self, issue: &mut Issue) -> Result<()> {
        let identity = issue.identity()?;
        {
            let conn = self.db.lock()?;
            conn.execute(
                "DELETE FROM bem_issue WHERE identity = ?1",
                [identity.as_bytes().to_vec()],
            )
            .map_err(|e| store_err("delete issue", e))?;
        }
        self.db.note_write();
        issue.mark_deleted();
        tracing::debug!("➖ issue {}/{} deleted", issue.host_name(), issue.object_name());
        Ok(())
    }
}
