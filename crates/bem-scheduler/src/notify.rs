//! Notification records: one row per notifier invocation, append-only.

use bem_core::{
    BemError, FieldValue, Identity, PropertyContainer, RecordSchema, Result, Severity,
};
use rusqlite::params_from_iter;

use crate::issue::Issue;
use crate::persistence::{BemDb, from_sql, store_err, to_sql};

pub struct NotificationSchema;

impl RecordSchema for NotificationSchema {
    const NAME: &'static str = "bem_notification";
    const FIELDS: &'static [&'static str] = &[
        "issue_identity",
        "cell_name",
        "host_name",
        "object_name",
        "severity",
        "attributes",
        "command_line",
        "system_user",
        "system_host_name",
        "pid",
        "ts_notification",
        "duration_ms",
        "exit_code",
        "output",
        "bem_event_id",
    ];
}

/// A single notifier run and its outcome.
#[derive(Debug, Clone)]
pub struct Notification {
    props: PropertyContainer<NotificationSchema>,
    id: Option<i64>,
}

impl Notification {
    /// A notification about `issue`, not yet run.
    pub fn for_issue(issue: &Issue) -> Result<Self> {
        let mut props = PropertyContainer::new();
        props.set("issue_identity", issue.identity()?.as_bytes().to_vec())?;
        props.set("cell_name", issue.cell_name())?;
        props.set("host_name", issue.host_name())?;
        props.set("object_name", issue.object_name())?;
        props.set("severity", issue.severity().map(|s| s.as_str()))?;
        props.set("attributes", issue.get("attributes")?.clone())?;
        Ok(Self { props, id: None })
    }

    pub fn get(&self, field: &str) -> Result<&FieldValue> {
        self.props.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<bool> {
        self.props.set(field, value)
    }

    fn text(&self, field: &str) -> Option<&str> {
        self.props.get(field).ok().and_then(FieldValue::as_str)
    }

    fn int(&self, field: &str) -> Option<i64> {
        self.props.get(field).ok().and_then(FieldValue::as_i64)
    }

    /// Row id once stored.
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn issue_identity(&self) -> Result<Identity> {
        match self.props.get("issue_identity")? {
            FieldValue::Blob(bytes) => Identity::from_slice(bytes),
            _ => Err(BemError::IdentityConflict(
                "notification without issue identity".into(),
            )),
        }
    }

    pub fn cell_name(&self) -> &str {
        self.text("cell_name").unwrap_or("")
    }

    pub fn host_name(&self) -> &str {
        self.text("host_name").unwrap_or("")
    }

    pub fn object_name(&self) -> &str {
        self.text("object_name").unwrap_or("")
    }

    pub fn severity(&self) -> Option<Severity> {
        self.text("severity").and_then(|s| s.parse().ok())
    }

    pub fn command_line(&self) -> Option<&str> {
        self.text("command_line")
    }

    pub fn system_user(&self) -> Option<&str> {
        self.text("system_user")
    }

    pub fn system_host_name(&self) -> Option<&str> {
        self.text("system_host_name")
    }

    pub fn pid(&self) -> Option<i64> {
        self.int("pid")
    }

    /// Process start, epoch milliseconds.
    pub fn ts_notification(&self) -> Option<i64> {
        self.int("ts_notification")
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.int("duration_ms")
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.int("exit_code")
    }

    pub fn output(&self) -> &str {
        self.text("output").unwrap_or("")
    }

    pub fn bem_event_id(&self) -> Option<&str> {
        self.text("bem_event_id")
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

/// Append-only store for [`Notification`]s.
#[derive(Clone)]
pub struct NotificationLog {
    db: BemDb,
}

impl NotificationLog {
    pub fn new(db: BemDb) -> Self {
        Self { db }
    }

    /// Insert a notification once. Returns its row id.
    pub fn store(&self, notification: &mut Notification) -> Result<i64> {
        if let Some(id) = notification.id {
            return Err(BemError::Store(format!(
                "notification {id} is already stored"
            )));
        }

        let values = notification.props.all_fields_for_persistence();
        let columns: Vec<&str> = values.iter().map(|(f, _)| *f).collect();
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            NotificationSchema::NAME,
            columns.join(", "),
            placeholders.join(", ")
        );

        let id = {
            let conn = self.db.lock()?;
            conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| to_sql(v))))
                .map_err(|e| store_err("insert notification", e))?;
            conn.last_insert_rowid()
        };
        self.db.note_write();
        notification.id = Some(id);
        notification.props.mark_unmodified();
        Ok(id)
    }

    fn query(&self, filter: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT id, {} FROM {} {filter}",
            NotificationSchema::FIELDS.join(", "),
            NotificationSchema::NAME
        );
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| store_err("prepare select", e))?;
        let rows = stmt
            .query_map(params, |row| {
                let id: i64 = row.get(0)?;
                let mut values = Vec::with_capacity(NotificationSchema::FIELDS.len());
                for (idx, field) in NotificationSchema::FIELDS.iter().enumerate() {
                    values.push((field.to_string(), from_sql(row.get_ref(idx + 1)?)));
                }
                Ok((id, values))
            })
            .map_err(|e| store_err("select notifications", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, values) = row.map_err(|e| store_err("read notification", e))?;
            let mut props = PropertyContainer::new();
            props.load_values(values)?;
            out.push(Notification { props, id: Some(id) });
        }
        Ok(out)
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Result<Vec<Notification>> {
        let limit = limit as i64;
        self.query("ORDER BY id DESC LIMIT ?1", &[&limit])
    }

    pub fn for_issue(&self, identity: &Identity, limit: usize) -> Result<Vec<Notification>> {
        let key = identity.as_bytes().to_vec();
        let limit = limit as i64;
        self.query(
            "WHERE issue_identity = ?1 ORDER BY id DESC LIMIT ?2",
            &[&key, &limit],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IssueStore;
    use crate::test_support::{prod_cell, service_row};

    fn issue(store: &IssueStore, host: &str) -> Issue {
        let mut issue = store
            .reconcile(&service_row(host, "http", "CRITICAL"), &prod_cell())
            .unwrap();
        store.store(&mut issue).unwrap();
        issue
    }

    #[test]
    fn test_for_issue_copies_issue_columns() {
        let store = IssueStore::new(BemDb::open_in_memory().unwrap());
        let issue = issue(&store, "web01");
        let n = Notification::for_issue(&issue).unwrap();
        assert_eq!(n.issue_identity().unwrap(), issue.identity().unwrap());
        assert_eq!(n.host_name(), "web01");
        assert_eq!(n.object_name(), "http");
        assert_eq!(n.severity(), Some(Severity::Critical));
        assert!(n.get("attributes").unwrap().as_str().unwrap().contains("web01"));
        assert_eq!(n.id(), None);
    }

    #[test]
    fn test_store_once_and_read_back() {
        let db = BemDb::open_in_memory().unwrap();
        let store = IssueStore::new(db.clone());
        let log = NotificationLog::new(db);
        let web01 = issue(&store, "web01");
        let web02 = issue(&store, "web02");

        for (issue, code) in [(&web01, 0i64), (&web02, 1), (&web01, 2)] {
            let mut n = Notification::for_issue(issue).unwrap();
            n.set("exit_code", code).unwrap();
            n.set("output", format!("exit {code}")).unwrap();
            log.store(&mut n).unwrap();
            assert!(n.id().is_some());
            assert!(log.store(&mut n).is_err());
        }

        let recent = log.recent(2).unwrap();
        let codes: Vec<_> = recent.iter().map(|n| n.exit_code()).collect();
        assert_eq!(codes, vec![Some(2), Some(1)]);

        let history = log.for_issue(&web01.identity().unwrap(), 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|n| n.host_name() == "web01"));
        assert_eq!(history[0].output(), "exit 2");
        assert!(!history[0].succeeded());
        assert!(history[1].succeeded());
    }
}
