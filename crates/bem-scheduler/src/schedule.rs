//! When issues are (re)notified.

use std::sync::Arc;

use bem_core::{Clock, Result, SystemClock};

use crate::issue::Issue;

#[derive(Clone)]
pub struct NotificationScheduler {
    clock: Arc<dyn Clock>,
}

impl NotificationScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Due once the next notification time has been reached. Issues
    /// without one are never due.
    pub fn is_due(&self, issue: &Issue, as_of_ms: i64) -> bool {
        issue
            .ts_next_notification()
            .is_some_and(|next| next <= as_of_ms)
    }

    /// Set the next notification time (now when `at_ms` is `None`) and make
    /// sure the counter exists.
    pub fn schedule_next(&self, issue: &mut Issue, at_ms: Option<i64>) -> Result<()> {
        let at = at_ms.unwrap_or_else(|| self.now_ms());
        issue.set("ts_next_notification", at)?;
        if issue.notification_count().is_none() {
            issue.set("notification_count", 0i64)?;
        }
        Ok(())
    }

    /// Record a notifier run that started at `started_at_ms`.
    pub fn note_dispatched(
        &self,
        issue: &mut Issue,
        started_at_ms: i64,
        renotify_interval_ms: i64,
    ) -> Result<()> {
        if issue.ts_first_notification().is_none() {
            issue.set("ts_first_notification", started_at_ms)?;
        }
        issue.set("ts_last_notification", started_at_ms)?;
        let count = issue.notification_count().unwrap_or(0);
        issue.set("notification_count", count + 1)?;
        self.schedule_next(issue, Some(started_at_ms + renotify_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bem_core::ManualClock;

    fn scheduler(now: i64) -> NotificationScheduler {
        NotificationScheduler::new(Arc::new(ManualClock::new(now)))
    }

    #[test]
    fn test_due_boundary_is_inclusive() {
        let s = scheduler(0);
        let mut issue = Issue::new();
        s.schedule_next(&mut issue, Some(10_000)).unwrap();
        assert!(!s.is_due(&issue, 9_999));
        assert!(s.is_due(&issue, 10_000));
        assert!(s.is_due(&issue, 10_001));

        // Rescheduled to t+1: no longer due at t.
        s.schedule_next(&mut issue, Some(10_001)).unwrap();
        assert!(!s.is_due(&issue, 10_000));
    }

    #[test]
    fn test_unscheduled_issue_is_never_due() {
        let s = scheduler(0);
        assert!(!s.is_due(&Issue::new(), i64::MAX));
    }

    #[test]
    fn test_schedule_next_initializes_counter_only_when_missing() {
        let s = scheduler(7_000);
        let mut issue = Issue::new();
        s.schedule_next(&mut issue, None).unwrap();
        assert_eq!(issue.notification_count(), Some(0));
        assert_eq!(issue.ts_next_notification(), Some(7_000));

        issue.set("notification_count", 5i64).unwrap();
        s.schedule_next(&mut issue, Some(8_000)).unwrap();
        assert_eq!(issue.notification_count(), Some(5));
    }

    #[test]
    fn test_note_dispatched() {
        let s = scheduler(0);
        let mut issue = Issue::new();
        s.schedule_next(&mut issue, Some(1_000)).unwrap();

        s.note_dispatched(&mut issue, 1_500, 60_000).unwrap();
        assert_eq!(issue.ts_first_notification(), Some(1_500));
        assert_eq!(issue.ts_last_notification(), Some(1_500));
        assert_eq!(issue.notification_count(), Some(1));
        assert_eq!(issue.ts_next_notification(), Some(61_500));

        s.note_dispatched(&mut issue, 61_600, 60_000).unwrap();
        assert_eq!(issue.ts_first_notification(), Some(1_500));
        assert_eq!(issue.ts_last_notification(), Some(61_600));
        assert_eq!(issue.notification_count(), Some(2));
        assert!(!s.is_due(&issue, 121_599));
        assert!(s.is_due(&issue, 121_600));
    }
}
