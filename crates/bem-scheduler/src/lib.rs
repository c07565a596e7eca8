//! # BEM Scheduler
//!
//! Turns monitoring problems into BEM notifications and keeps their history.
//!
//! ## Architecture
//! ```text
//! CellRunner (tokio interval, one per cell)
//!   ├── IdoDb::fetch_problems          → MonitoringProblemRow per object
//!   ├── IssueStore::reconcile / store  → bem_issue (dirty fields only)
//!   ├── NotificationScheduler          → is it due? when next?
//!   └── NotificationDispatcher         → notifier process (e.g. msend)
//!         └── ProcessResultHandler     → bem_notification (append-only)
//! ```

pub mod dispatch;
pub mod engine;
pub mod exit_codes;
pub mod issue;
pub mod notify;
pub mod persistence;
pub mod result;
pub mod schedule;
pub mod store;

#[cfg(test)]
mod test_support;

pub use dispatch::{NotificationDispatcher, shell_join};
pub use engine::{CellRunner, PassSummary, spawn_cell_loop};
pub use exit_codes::describe_exit_code;
pub use issue::Issue;
pub use notify::{Notification, NotificationLog};
pub use persistence::BemDb;
pub use result::{ProcessResultHandler, derive_exit_code, extract_event_id};
pub use schedule::NotificationScheduler;
pub use store::IssueStore;
