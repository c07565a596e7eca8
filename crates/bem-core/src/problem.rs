//! Monitoring state rows and severities.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Hard state reported for objects whose hard state is not known yet.
pub const HARD_STATE_PENDING: i64 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Host,
    Service,
}

impl ObjectType {
    /// Prefix for custom variables attached to this kind of object.
    pub fn vars_prefix(&self) -> &'static str {
        match self {
            ObjectType::Host => "host.vars.",
            ObjectType::Service => "service.vars.",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Host => write!(f, "host"),
            ObjectType::Service => write!(f, "service"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateType {
    Soft,
    Hard,
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateType::Soft => write!(f, "SOFT"),
            StateType::Hard => write!(f, "HARD"),
        }
    }
}

/// One monitored object's current problem state, enriched with its custom
/// variables. Lives for a single reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringProblemRow {
    /// IDO object id; `None` for synthesized rows.
    pub id: Option<i64>,
    pub object_type: ObjectType,
    /// Owning host object id (services only).
    pub host_id: Option<i64>,
    pub host_name: String,
    pub service_name: Option<String>,
    pub state_type: StateType,
    /// State label: UP/DOWN/UNREACHABLE or OK/WARNING/CRITICAL/UNKNOWN.
    pub state: String,
    /// Last hard state code, [`HARD_STATE_PENDING`] when not yet checked.
    pub hard_state: i64,
    pub is_acknowledged: bool,
    pub is_in_downtime: bool,
    pub output: String,
    /// `host.vars.*` / `service.vars.*` attributes.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// False when custom variable enrichment failed: absent vars are unknown.
    #[serde(default = "default_true")]
    pub vars_complete: bool,
}

fn default_true() -> bool {
    true
}

impl MonitoringProblemRow {
    /// Object name as used in identities: the service name, empty for hosts.
    pub fn object_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or("")
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Healthy hard state: nothing left to escalate.
    pub fn is_healthy(&self) -> bool {
        self.hard_state == 0 || matches!(self.state.as_str(), "UP" | "OK")
    }

    /// Value of a row placeholder such as `host_name` or `service.vars.team`.
    pub fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "host_name" => Some(self.host_name.clone()),
            "service_name" => Some(self.object_name().to_string()),
            "state" => Some(self.state.clone()),
            "state_type" => Some(self.state_type.to_string()),
            "hard_state" => Some(self.hard_state.to_string()),
            "output" => Some(self.output.clone()),
            "object_type" => Some(self.object_type.to_string()),
            _ => self.vars.get(key).cloned(),
        }
    }
}

/// Event severity as understood by BEM, ordered from harmless to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" => Ok(Severity::Ok),
            "INFO" => Ok(Severity::Info),
            "WARNING" => Ok(Severity::Warning),
            "MINOR" => Ok(Severity::Minor),
            "MAJOR" => Ok(Severity::Major),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}
