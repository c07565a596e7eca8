//! # BEM Core
//!
//! Shared building blocks for correlating monitoring problems with the BMC
//! Event Manager (BEM):
//!
//! - [`PropertyContainer`]: dirty-tracked field records used by issues and
//!   notifications.
//! - [`identity`]: stable SHA-1 identities for `(cell, host, object)`.
//! - [`MonitoringProblemRow`]: one enriched monitoring state row.
//! - [`CellConfig`]: the per-cell rules (severity, fields, inclusion).
//! - [`BemConfig`]: TOML configuration.

pub mod cell;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod problem;
pub mod property;
pub mod template;

pub use cell::{CellConfig, NotifierContext, RuleCellConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BemConfig, CellSettings, NotifierSettings};
pub use error::{BemError, Result};
pub use identity::{Identity, compute_identity};
pub use problem::{MonitoringProblemRow, ObjectType, Severity, StateType};
pub use property::{FieldValue, PropertyContainer, RecordSchema};
