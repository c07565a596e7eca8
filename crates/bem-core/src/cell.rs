//! Cell rules: how monitoring objects turn into BEM events.

use std::time::Duration;

use indexmap::IndexMap;

use crate::config::{CellSettings, NotifierSettings};
use crate::error::{BemError, Result};
use crate::problem::{MonitoringProblemRow, Severity, StateType};
use crate::template;

/// What a notifier invocation is rendered from.
#[derive(Debug, Clone)]
pub struct NotifierContext<'a> {
    pub cell: &'a str,
    pub host: &'a str,
    pub object: &'a str,
    pub severity: Option<Severity>,
    pub fields: &'a IndexMap<String, String>,
}

impl NotifierContext<'_> {
    /// `key=value` pairs of all mapped fields, joined by `;`.
    pub fn slots(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "cell" => Some(self.cell.to_string()),
            "host" => Some(self.host.to_string()),
            "object" => Some(self.object.to_string()),
            "severity" => self.severity.map(|s| s.to_string()),
            "slots" => Some(self.slots()),
            _ => self.fields.get(key).cloned(),
        }
    }
}

/// Read-only capability describing one target cell.
pub trait CellConfig: Send + Sync {
    fn name(&self) -> &str;

    fn calculate_severity(&self, row: &MonitoringProblemRow) -> Severity;

    /// Ordered slot values; always contains `host` and `object`.
    fn extract_fields(&self, row: &MonitoringProblemRow) -> Result<IndexMap<String, String>>;

    /// Inclusion policy: should this object be escalated at all?
    fn wants_object(&self, row: &MonitoringProblemRow) -> bool;

    fn renotify_interval_ms(&self) -> i64;

    /// Notifier argv, program first.
    fn notifier_command(&self, ctx: &NotifierContext<'_>) -> Vec<String>;

    fn notifier_timeout(&self) -> Duration;
}

/// [`CellConfig`] driven by [`CellSettings`] from the TOML config.
#[derive(Debug, Clone)]
pub struct RuleCellConfig {
    settings: CellSettings,
}

impl RuleCellConfig {
    pub fn new(settings: CellSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CellSettings {
        &self.settings
    }

    fn notifier(&self) -> &NotifierSettings {
        &self.settings.notifier
    }
}

impl CellConfig for RuleCellConfig {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn calculate_severity(&self, row: &MonitoringProblemRow) -> Severity {
        if let Some(var) = &self.settings.severity_var
            && let Some(value) = row.var(var)
        {
            match value.parse() {
                Ok(severity) => return severity,
                Err(e) => tracing::debug!("ignoring {var} on {}: {e}", row.host_name),
            }
        }

        self.settings
            .severity
            .get(&row.state)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::Minor)
    }

    fn extract_fields(&self, row: &MonitoringProblemRow) -> Result<IndexMap<String, String>> {
        let fields: IndexMap<String, String> = self
            .settings
            .fields
            .iter()
            .map(|(target, tpl)| (target.clone(), template::render(tpl, |k| row.lookup(k))))
            .collect();

        for key in ["host", "object"] {
            if !fields.contains_key(key) {
                return Err(BemError::Config(format!(
                    "cell '{}' does not map the '{key}' field",
                    self.settings.name
                )));
            }
        }
        Ok(fields)
    }

    fn wants_object(&self, row: &MonitoringProblemRow) -> bool {
        if row.is_acknowledged || row.is_in_downtime {
            return false;
        }
        if row.state_type == StateType::Soft && !self.settings.include_soft {
            return false;
        }
        self.settings
            .require_vars
            .iter()
            .all(|(key, wanted)| row.var(key) == Some(wanted.as_str()))
    }

    fn renotify_interval_ms(&self) -> i64 {
        self.settings.renotify_interval_secs as i64 * 1000
    }

    fn notifier_command(&self, ctx: &NotifierContext<'_>) -> Vec<String> {
        let notifier = self.notifier();
        std::iter::once(notifier.program.clone())
            .chain(
                notifier
                    .args
                    .iter()
                    .map(|arg| template::render(arg, |k| ctx.lookup(k))),
            )
            .collect()
    }

    fn notifier_timeout(&self) -> Duration {
        Duration::from_secs(self.notifier().timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::ObjectType;
    use std::collections::BTreeMap;

    fn row(state: &str) -> MonitoringProblemRow {
        MonitoringProblemRow {
            id: Some(7),
            object_type: ObjectType::Service,
            host_id: Some(1),
            host_name: "db01".into(),
            service_name: Some("pgsql".into()),
            state_type: StateType::Hard,
            state: state.into(),
            hard_state: 2,
            is_acknowledged: false,
            is_in_downtime: false,
            output: "too many connections".into(),
            vars: BTreeMap::from([
                ("host.vars.location".to_string(), "vienna".to_string()),
                ("host.vars.bem".to_string(), "yes".to_string()),
            ]),
            vars_complete: true,
        }
    }

    fn cell() -> RuleCellConfig {
        let mut settings = CellSettings::named("prod");
        settings
            .fields
            .insert("mc_location".into(), "{host.vars.location}".into());
        settings
            .require_vars
            .insert("host.vars.bem".into(), "yes".into());
        settings.severity_var = Some("service.vars.bem_severity".into());
        RuleCellConfig::new(settings)
    }

    #[test]
    fn test_severity_from_state_map() {
        let cell = cell();
        assert_eq!(cell.calculate_severity(&row("CRITICAL")), Severity::Critical);
        assert_eq!(cell.calculate_severity(&row("WARNING")), Severity::Warning);
        assert_eq!(cell.calculate_severity(&row("WEIRD")), Severity::Minor);
    }

    #[test]
    fn test_severity_var_override() {
        let cell = cell();
        let mut r = row("CRITICAL");
        r.vars
            .insert("service.vars.bem_severity".into(), "major".into());
        assert_eq!(cell.calculate_severity(&r), Severity::Major);
        r.vars
            .insert("service.vars.bem_severity".into(), "bogus".into());
        assert_eq!(cell.calculate_severity(&r), Severity::Critical);
    }

    #[test]
    fn test_extract_fields_keeps_order() {
        let fields = cell().extract_fields(&row("CRITICAL")).unwrap();
        let pairs: Vec<_> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(
            pairs,
            vec![("host", "db01"), ("object", "pgsql"), ("mc_location", "vienna")]
        );
    }

    #[test]
    fn test_extract_fields_requires_host_and_object() {
        let mut settings = CellSettings::named("prod");
        settings.fields.shift_remove("object");
        let err = RuleCellConfig::new(settings)
            .extract_fields(&row("CRITICAL"))
            .unwrap_err();
        assert!(matches!(err, BemError::Config(_)));
    }

    #[test]
    fn test_wants_object() {
        let cell = cell();
        assert!(cell.wants_object(&row("CRITICAL")));

        let mut acked = row("CRITICAL");
        acked.is_acknowledged = true;
        assert!(!cell.wants_object(&acked));

        let mut soft = row("CRITICAL");
        soft.state_type = StateType::Soft;
        assert!(!cell.wants_object(&soft));

        let mut untagged = row("CRITICAL");
        untagged.vars.remove("host.vars.bem");
        assert!(!cell.wants_object(&untagged));
    }

    #[test]
    fn test_notifier_command() {
        let cell = cell();
        let r = row("CRITICAL");
        let fields = cell.extract_fields(&r).unwrap();
        let ctx = NotifierContext {
            cell: "prod",
            host: "db01",
            object: "pgsql",
            severity: Some(Severity::Critical),
            fields: &fields,
        };
        assert_eq!(
            cell.notifier_command(&ctx),
            vec![
                "msend",
                "-n",
                "prod",
                "-r",
                "CRITICAL",
                "-b",
                "host=db01;object=pgsql;mc_location=vienna"
            ]
        );
        assert_eq!(cell.renotify_interval_ms(), 3_600_000);
        assert_eq!(cell.notifier_timeout(), Duration::from_secs(30));
    }
}
