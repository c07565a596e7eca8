//! BEM configuration system.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{BemError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BemConfig {
    /// SQLite database holding issues and notifications.
    #[serde(default = "default_state_db")]
    pub state_db: String,
    /// Monitoring (IDO) database, opened read-only.
    #[serde(default = "default_ido_db")]
    pub ido_db: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_dispatch: usize,
    #[serde(default)]
    pub cells: Vec<CellSettings>,
}

fn default_state_db() -> String { "~/.bem/bem.db".into() }
fn default_ido_db() -> String { "~/.bem/ido.db".into() }
fn default_poll_interval() -> u64 { 60 }
fn default_max_parallel() -> usize { 4 }

impl Default for BemConfig {
    fn default() -> Self {
        Self {
            state_db: default_state_db(),
            ido_db: default_ido_db(),
            poll_interval_secs: default_poll_interval(),
            max_parallel_dispatch: default_max_parallel(),
            cells: Vec::new(),
        }
    }
}

impl BemConfig {
    /// Load config from the default path (~/.bem/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BemError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BemError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for cell in &self.cells {
            if cell.name.trim().is_empty() {
                return Err(BemError::Config("cell without a name".into()));
            }
            if !seen.insert(cell.name.as_str()) {
                return Err(BemError::Config(format!("duplicate cell '{}'", cell.name)));
            }
            for key in ["host", "object"] {
                if !cell.fields.contains_key(key) {
                    return Err(BemError::Config(format!(
                        "cell '{}' does not map the '{key}' field",
                        cell.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the BEM home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bem")
    }

    pub fn state_db_path(&self) -> PathBuf {
        expand_path(&self.state_db)
    }

    pub fn ido_db_path(&self) -> PathBuf {
        expand_path(&self.ido_db)
    }

    pub fn enabled_cells(&self) -> impl Iterator<Item = &CellSettings> {
        self.cells.iter().filter(|c| c.enabled)
    }
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// One BEM cell: where events go and how objects map onto them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellSettings {
    pub name: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_renotify_interval")]
    pub renotify_interval_secs: u64,
    /// State label (DOWN, CRITICAL, ...) to severity name.
    #[serde(default = "default_severity_map")]
    pub severity: BTreeMap<String, String>,
    /// Attribute whose value, when a valid severity, overrides the mapping.
    #[serde(default)]
    pub severity_var: Option<String>,
    /// Target slot → placeholder template. Must contain `host` and `object`.
    #[serde(default = "default_fields")]
    pub fields: IndexMap<String, String>,
    /// Attribute → value pairs an object must carry to be escalated.
    #[serde(default)]
    pub require_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub include_soft: bool,
    #[serde(default)]
    pub notifier: NotifierSettings,
}

fn bool_true() -> bool { true }
fn default_renotify_interval() -> u64 { 3600 }

fn default_severity_map() -> BTreeMap<String, String> {
    [
        ("DOWN", "CRITICAL"),
        ("UNREACHABLE", "MAJOR"),
        ("CRITICAL", "CRITICAL"),
        ("WARNING", "WARNING"),
        ("UNKNOWN", "MINOR"),
        ("UP", "OK"),
        ("OK", "OK"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_fields() -> IndexMap<String, String> {
    IndexMap::from([
        ("host".to_string(), "{host_name}".to_string()),
        ("object".to_string(), "{service_name}".to_string()),
    ])
}

impl CellSettings {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            renotify_interval_secs: default_renotify_interval(),
            severity: default_severity_map(),
            severity_var: None,
            fields: default_fields(),
            require_vars: BTreeMap::new(),
            include_soft: false,
            notifier: NotifierSettings::default(),
        }
    }
}

/// External notifier process (e.g. `msend`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSettings {
    #[serde(default = "default_notifier_program")]
    pub program: String,
    /// Argument templates. Besides row placeholders these may use `{cell}`,
    /// `{host}`, `{object}`, `{severity}`, `{slots}` and any mapped field.
    #[serde(default = "default_notifier_args")]
    pub args: Vec<String>,
    #[serde(default = "default_notifier_timeout")]
    pub timeout_secs: u64,
}

fn default_notifier_program() -> String { "msend".into() }
fn default_notifier_args() -> Vec<String> {
    vec![
        "-n".into(),
        "{cell}".into(),
        "-r".into(),
        "{severity}".into(),
        "-b".into(),
        "{slots}".into(),
    ]
}
fn default_notifier_timeout() -> u64 { 30 }

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            program: default_notifier_program(),
            args: default_notifier_args(),
            timeout_secs: default_notifier_timeout(),
        }
    }
}
