//! The persistent issue: one correlated problem per cell/host/object.

use std::sync::OnceLock;

use bem_core::{
    BemError, CellConfig, FieldValue, Identity, MonitoringProblemRow, PropertyContainer,
    RecordSchema, Result, Severity, compute_identity,
};
use indexmap::IndexMap;

pub struct IssueSchema;

impl RecordSchema for IssueSchema {
    const NAME: &'static str = "bem_issue";
    const FIELDS: &'static [&'static str] = &[
        "identity",
        "cell_name",
        "host_name",
        "object_name",
        "ido_host_name",
        "ido_service_name",
        "is_relevant",
        "severity",
        "worst_severity",
        "attributes",
        "ts_first_notification",
        "ts_last_notification",
        "ts_next_notification",
        "notification_count",
    ];
}

/// Values a problem row decides. Everything else is notification history.
const PROBLEM_FIELDS: &[&str] = &[
    "cell_name",
    "host_name",
    "object_name",
    "ido_host_name",
    "ido_service_name",
    "severity",
    "attributes",
];

/// A correlated problem and its notification history.
#[derive(Debug, Clone)]
pub struct Issue {
    props: PropertyContainer<IssueSchema>,
    persisted: bool,
    attributes: OnceLock<IndexMap<String, String>>,
}

impl Default for Issue {
    fn default() -> Self {
        Self::new()
    }
}

impl Issue {
    /// A fresh, never stored issue.
    pub fn new() -> Self {
        Self {
            props: PropertyContainer::new(),
            persisted: false,
            attributes: OnceLock::new(),
        }
    }

    /// Hydrate a stored row; nothing is marked modified.
    pub(crate) fn from_values<I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, FieldValue)>,
    {
        let mut issue = Self::new();
        issue.props.load_values(values)?;
        issue.persisted = true;
        Ok(issue)
    }

    pub fn get(&self, field: &str) -> Result<&FieldValue> {
        self.props.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<bool> {
        let changed = self.props.set(field, value)?;
        if changed && field == "attributes" {
            self.attributes = OnceLock::new();
        }
        Ok(changed)
    }

    pub(crate) fn props(&self) -> &PropertyContainer<IssueSchema> {
        &self.props
    }

    fn text(&self, field: &str) -> Option<&str> {
        self.props.get(field).ok().and_then(FieldValue::as_str)
    }

    fn int(&self, field: &str) -> Option<i64> {
        self.props.get(field).ok().and_then(FieldValue::as_i64)
    }

    pub fn identity(&self) -> Result<Identity> {
        match self.props.get("identity")? {
            FieldValue::Blob(bytes) => Identity::from_slice(bytes),
            _ => Err(BemError::IdentityConflict(
                "issue has no identity yet".into(),
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

    /// Never stored, or deleted since.
    pub fn is_new(&self) -> bool {
        !self.persisted
    }

    /// Monitoring host and service this issue was raised for. Rows stored
    /// before these were recorded fall back to the mapped names.
    pub fn monitored_object(&self) -> (&str, Option<&str>) {
        match self.text("ido_host_name") {
            Some(host) => (host, self.text("ido_service_name")),
            None => (
                self.host_name(),
                Some(self.object_name()).filter(|o| !o.is_empty()),
            ),
        }
    }

    /// Unknown relevance counts as not relevant.
    pub fn is_relevant(&self) -> bool {
        self.text("is_relevant") == Some("y")
    }

    pub fn relevance_known(&self) -> bool {
        self.text("is_relevant").is_some()
    }

    pub fn severity(&self) -> Option<Severity> {
        self.text("severity").and_then(|s| s.parse().ok())
    }

    pub fn worst_severity(&self) -> Option<Severity> {
        self.text("worst_severity").and_then(|s| s.parse().ok())
    }

    pub fn ts_first_notification(&self) -> Option<i64> {
        self.int("ts_first_notification")
    }

    pub fn ts_last_notification(&self) -> Option<i64> {
        self.int("ts_last_notification")
    }

    pub fn ts_next_notification(&self) -> Option<i64> {
        self.int("ts_next_notification")
    }

    pub fn notification_count(&self) -> Option<i64> {
        self.int("notification_count")
    }

    /// Extracted fields, parsed once from the stored JSON.
    pub fn attributes(&self) -> &IndexMap<String, String> {
        self.attributes.get_or_init(|| match self.text("attributes") {
            Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
                tracing::warn!("bad attributes on {}/{}: {e}", self.host_name(), self.object_name());
                IndexMap::new()
            }),
            None => IndexMap::new(),
        })
    }

    fn set_attributes(&mut self, fields: &IndexMap<String, String>) -> Result<()> {
        let json = serde_json::to_string(fields)?;
        if self.set("attributes", json)? {
            self.attributes = OnceLock::from(fields.clone());
        }
        Ok(())
    }

    pub fn has_been_modified(&self) -> bool {
        self.props.has_been_modified()
    }

    pub fn modified_fields(&self) -> Vec<&'static str> {
        self.props.modified_fields()
    }

    /// Copy a problem row's derived values onto this issue. Notification
    /// history is left alone; relevance only moves when the row's custom
    /// variables are known.
    pub fn set_problem(&mut self, row: &MonitoringProblemRow, cell: &dyn CellConfig) -> Result<()> {
        let fields = cell.extract_fields(row)?;
        let host = fields.get("host").cloned().unwrap_or_default();
        let object = fields.get("object").cloned().unwrap_or_default();
        let severity = cell.calculate_severity(row);

        self.set("cell_name", cell.name())?;
        self.set("host_name", host)?;
        self.set("object_name", object)?;
        self.set("ido_host_name", row.host_name.as_str())?;
        match &row.service_name {
            Some(service) => self.set("ido_service_name", service.as_str())?,
            None => self.set("ido_service_name", FieldValue::Null)?,
        };
        self.set("severity", severity.as_str())?;
        self.set_attributes(&fields)?;
        self.recalculate_identity()?;
        self.raise_worst_severity(severity)?;

        if row.vars_complete {
            let relevant = if cell.wants_object(row) { "y" } else { "n" };
            self.set("is_relevant", relevant)?;
        } else {
            tracing::debug!(
                "vars unknown for {}/{}, relevance untouched",
                self.host_name(),
                self.object_name()
            );
        }
        Ok(())
    }

    /// Take over the problem-derived values of `other`, a record for the same
    /// identity. This record's notification history stays as it is.
    pub(crate) fn absorb_problem(&mut self, other: &Issue) -> Result<()> {
        for field in PROBLEM_FIELDS {
            self.set(field, other.get(field)?.clone())?;
        }
        if other.relevance_known() {
            self.set("is_relevant", other.get("is_relevant")?.clone())?;
        }
        if let Some(worst) = other.worst_severity() {
            self.raise_worst_severity(worst)?;
        }
        Ok(())
    }

    /// Identity derived from the current cell, host and object names.
    pub fn computed_identity(&self) -> Identity {
        compute_identity(self.cell_name(), self.host_name(), self.object_name())
    }

    fn recalculate_identity(&mut self) -> Result<()> {
        let identity = self.computed_identity();
        self.set("identity", identity.as_bytes().to_vec())?;
        Ok(())
    }

    fn raise_worst_severity(&mut self, severity: Severity) -> Result<()> {
        if self.worst_severity().is_none_or(|worst| severity > worst) {
            self.set("worst_severity", severity.as_str())?;
        }
        Ok(())
    }

    pub(crate) fn mark_stored(&mut self) {
        self.persisted = true;
        self.props.mark_unmodified();
    }

    /// After a delete: a later store re-inserts every non-default value.
    pub(crate) fn mark_deleted(&mut self) {
        self.persisted = false;
        self.props.mark_non_defaults_modified();
    }
}
