//! Collects one notifier run's output and turns it into a stored
//! [`Notification`].

use std::sync::LazyLock;

use bem_core::Result;
use regex::Regex;

use crate::notify::{Notification, NotificationLog};

static EVENT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Message #(\d+) - Evtid = (\d+)").expect("event id pattern is valid")
});

/// Exit code to record: the process' own code, else 128 + terminating
/// signal, else 255.
pub fn derive_exit_code(exit_code: Option<i32>, signal: Option<i32>) -> i64 {
    match (exit_code, signal) {
        (Some(code), _) => i64::from(code),
        (None, Some(signal)) => 128 + i64::from(signal),
        (None, None) => 255,
    }
}

/// The BEM event id reported by the notifier, if any.
pub fn extract_event_id(output: &str) -> Option<String> {
    EVENT_ID
        .captures(output)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().to_string())
}

/// Lifecycle of a single notifier run. [`ProcessResultHandler::finish`]
/// consumes the handler, so a run is finalized at most once.
pub struct ProcessResultHandler {
    notification: Notification,
    log: NotificationLog,
    output: Vec<u8>,
    started_at_ms: Option<i64>,
}

impl ProcessResultHandler {
    pub fn new(notification: Notification, log: NotificationLog) -> Self {
        Self {
            notification,
            log,
            output: Vec::new(),
            started_at_ms: None,
        }
    }

    /// Record the command line and who runs it from where.
    pub fn start(&mut self, command_line: &str, now_ms: i64) -> Result<()> {
        self.started_at_ms = Some(now_ms);
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        self.notification.set("command_line", command_line)?;
        self.notification.set("system_user", whoami::username())?;
        self.notification.set("system_host_name", host)?;
        Ok(())
    }

    pub fn add_output(&mut self, chunk: &[u8]) -> &mut Self {
        self.output.extend_from_slice(chunk);
        self
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Fill in the outcome and append the notification to the log.
    pub fn finish(
        mut self,
        exit_code: Option<i32>,
        signal: Option<i32>,
        pid: Option<u32>,
        now_ms: i64,
    ) -> Result<Notification> {
        let started = self.started_at_ms.unwrap_or(now_ms);
        let output = self.output();
        let code = derive_exit_code(exit_code, signal);

        let n = &mut self.notification;
        n.set("pid", pid)?;
        n.set("ts_notification", started)?;
        n.set("duration_ms", (now_ms - started).max(0))?;
        n.set("exit_code", code)?;
        n.set("bem_event_id", extract_event_id(&output))?;
        n.set("output", output)?;

        self.log.store(&mut self.notification)?;
        tracing::debug!(
            "notification for {}/{} stored, exit {code}",
            self.notification.host_name(),
            self.notification.object_name()
        );
        Ok(self.notification)
    }
}
