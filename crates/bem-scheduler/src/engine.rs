//! Cell runner: one reconciliation pass per tick.
//!
//! ```text
//! fetch problems ──► reconcile + store each row ──► close vanished issues
//!                                                        │
//!                          dispatch due issues ◄─────────┘
//!                          (bounded concurrency)
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bem_core::{CellConfig, Result};
use bem_ido::IdoDb;
use futures::StreamExt;

use crate::dispatch::NotificationDispatcher;
use crate::issue::Issue;
use crate::notify::NotificationLog;
use crate::persistence::BemDb;
use crate::schedule::NotificationScheduler;
use crate::store::IssueStore;

/// What a pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub problems: usize,
    pub stored: usize,
    pub closed: usize,
    pub dispatched: usize,
    /// Dispatches that errored or whose notifier exited non-zero.
    pub failed: usize,
}

pub struct CellRunner {
    cell: Arc<dyn CellConfig>,
    ido: Arc<IdoDb>,
    issues: IssueStore,
    scheduler: NotificationScheduler,
    dispatcher: NotificationDispatcher,
    max_parallel: usize,
}

impl CellRunner {
    pub fn new(
        cell: Arc<dyn CellConfig>,
        ido: Arc<IdoDb>,
        db: BemDb,
        scheduler: NotificationScheduler,
    ) -> Self {
        Self {
            cell,
            ido,
            issues: IssueStore::new(db.clone()),
            dispatcher: NotificationDispatcher::new(NotificationLog::new(db))
                .with_clock(scheduler.clock()),
            scheduler,
            max_parallel: 4,
        }
    }

    /// Upper bound for notifier processes running at once.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn cell_name(&self) -> &str {
        self.cell.name()
    }

    pub fn issues(&self) -> &IssueStore {
        &self.issues
    }

    pub async fn run_pass(&self) -> Result<PassSummary> {
        let cell = self.cell.as_ref();
        let now = self.scheduler.now_ms();
        let problems = self.ido.fetch_problems()?;
        let mut summary = PassSummary {
            problems: problems.len(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        let mut active = Vec::with_capacity(problems.len());
        for row in problems.values() {
            let mut issue = self.issues.reconcile(row, cell)?;
            if issue.is_relevant() && issue.ts_next_notification().is_none() {
                self.scheduler.schedule_next(&mut issue, Some(now))?;
            }
            if self.issues.store(&mut issue)? {
                summary.stored += 1;
            }
            seen.insert(issue.identity()?);
            active.push(issue);
        }

        for issue in self.issues.list_for_cell(cell.name())? {
            if seen.contains(&issue.identity()?) {
                continue;
            }
            self.recheck(issue, &mut summary)?;
        }

        let due: Vec<Issue> = active
            .into_iter()
            .filter(|issue| issue.is_relevant() && self.scheduler.is_due(issue, now))
            .collect();
        if !due.is_empty() {
            self.dispatch_all(due, &mut summary).await?;
        }

        tracing::info!(
            "🔁 [{}] {} problems, {} stored, {} closed, {} notified ({} failed)",
            cell.name(),
            summary.problems,
            summary.stored,
            summary.closed,
            summary.dispatched,
            summary.failed
        );
        Ok(summary)
    }

    /// A stored issue that is no longer a current problem: close it when
    /// the object recovered or disappeared, refresh it otherwise.
    fn recheck(&self, mut issue: Issue, summary: &mut PassSummary) -> Result<()> {
        let cell = self.cell.as_ref();
        let (host, service) = issue.monitored_object();
        let host = host.to_string();
        let service = service.map(str::to_string);

        let row = match self.ido.get_state_row_for(&host, service.as_deref())? {
            Some(row) => row,
            None => self.ido.get_empty_state_row_for(&host, service.as_deref()),
        };

        if row.is_healthy() {
            tracing::info!("✅ [{}] {host}/{} recovered, closing", cell.name(), issue.object_name());
            self.issues.delete(&mut issue)?;
            summary.closed += 1;
            return Ok(());
        }

        let mut issue = self.issues.reconcile(&row, cell)?;
        if self.issues.store(&mut issue)? {
            summary.stored += 1;
        }
        Ok(())
    }

    async fn dispatch_all(&self, due: Vec<Issue>, summary: &mut PassSummary) -> Result<()> {
        let cell = self.cell.as_ref();
        let dispatcher = &self.dispatcher;

        let results: Vec<_> = futures::stream::iter(due)
            .map(move |issue| async move {
                let result = dispatcher.dispatch(&issue, cell).await;
                (issue, result)
            })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        let mut first_error = None;
        for (mut issue, result) in results {
            let notification = match result {
                Ok(notification) => notification,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        "⚠️ [{}] dispatch for {}/{} failed: {e}",
                        cell.name(),
                        issue.host_name(),
                        issue.object_name()
                    );
                    continue;
                }
            };

            summary.dispatched += 1;
            if !notification.succeeded() {
                summary.failed += 1;
                tracing::warn!(
                    "⚠️ [{}] notifier for {}/{} exited {:?}",
                    cell.name(),
                    issue.host_name(),
                    issue.object_name(),
                    notification.exit_code()
                );
            }

            let started = notification
                .ts_notification()
                .unwrap_or_else(|| self.scheduler.now_ms());
            if let Err(e) = self.record_dispatch(&mut issue, started) {
                summary.failed += 1;
                tracing::error!(
                    "❌ [{}] notified {}/{} but could not record it: {e}",
                    cell.name(),
                    issue.host_name(),
                    issue.object_name()
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Advance the schedule of a notified issue. A row that was deleted
    /// while the notifier ran is stored again with its history.
    fn record_dispatch(&self, issue: &mut Issue, started_at_ms: i64) -> Result<()> {
        self.scheduler
            .note_dispatched(issue, started_at_ms, self.cell.renotify_interval_ms())?;
        match self.issues.store(issue) {
            Ok(_) => return Ok(()),
            Err(e) => tracing::debug!(
                "storing notified issue {}/{} failed, reloading: {e}",
                issue.host_name(),
                issue.object_name()
            ),
        }

        match self.issues.load_by_identity(&issue.identity()?)? {
            Some(mut stored) => {
                self.scheduler.note_dispatched(
                    &mut stored,
                    started_at_ms,
                    self.cell.renotify_interval_ms(),
                )?;
                self.issues.store(&mut stored)?;
            }
            None => {
                tracing::debug!(
                    "issue {}/{} vanished during dispatch, storing it again",
                    issue.host_name(),
                    issue.object_name()
                );
                issue.mark_deleted();
                self.issues.store(issue)?;
            }
        }
        Ok(())
    }
}

/// Run passes for one cell forever, one per `every`.
pub async fn spawn_cell_loop(runner: Arc<CellRunner>, every: Duration) {
    tracing::info!("⏰ [{}] started (pass every {}s)", runner.cell_name(), every.as_secs());
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(e) = runner.run_pass().await {
            if e.is_retryable() {
                tracing::warn!("⚠️ [{}] pass failed, retrying next tick: {e}", runner.cell_name());
            } else {
                tracing::error!("❌ [{}] pass failed: {e}", runner.cell_name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bem_core::{CellSettings, Clock, ManualClock, RuleCellConfig, Severity};
    use bem_ido::IdoFixture;

    const HOUR_MS: i64 = 3_600_000;

    struct World {
        ido: IdoFixture,
        db: BemDb,
        clock: Arc<ManualClock>,
        runner: CellRunner,
        _dir: tempfile::TempDir,
    }

    fn world() -> World {
        world_with(|_| {})
    }

    fn world_with(configure: impl FnOnce(&mut CellSettings)) -> World {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("msend.sh");
        std::fs::write(&script, "echo \"$*\"\necho 'Message #1 - Evtid = 77'\n").unwrap();

        let mut settings = CellSettings::named("prod");
        settings.notifier.program = "/bin/sh".into();
        settings.notifier.args = vec![script.display().to_string(), "{severity}".into()];
        configure(&mut settings);

        let ido = IdoFixture::new().unwrap();
        let db = BemDb::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(10 * HOUR_MS));
        let runner = CellRunner::new(
            Arc::new(RuleCellConfig::new(settings)),
            Arc::new(ido.open_ido().unwrap()),
            db.clone(),
            NotificationScheduler::new(clock.clone()),
        )
        .with_max_parallel(2);

        World {
            ido,
            db,
            clock,
            runner,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_pass_notifies_new_problems_once() {
        let w = world();
        let web01 = w.ido.host("web01", 0).unwrap();
        w.ido.service(web01, "web01", "http", 2).unwrap();
        w.ido.host("db01", 1).unwrap();

        let summary = w.runner.run_pass().await.unwrap();
        assert_eq!(summary.problems, 2);
        assert_eq!(summary.stored, 2);
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.failed, 0);

        let issue = w.runner.issues().load("prod", "web01", "http").unwrap().unwrap();
        assert_eq!(issue.notification_count(), Some(1));
        assert_eq!(issue.ts_first_notification(), issue.ts_last_notification());
        assert_eq!(
            issue.ts_next_notification(),
            issue.ts_last_notification().map(|t| t + HOUR_MS)
        );
        let host = w.runner.issues().load("prod", "db01", "").unwrap().unwrap();
        assert_eq!(host.severity(), Some(Severity::Critical));

        let log = NotificationLog::new(w.db.clone());
        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|n| n.bem_event_id() == Some("77")));

        // Nothing changed, nothing due: no writes at all.
        let writes = w.db.write_count();
        let summary = w.runner.run_pass().await.unwrap();
        assert_eq!(summary.stored, 0);
        assert_eq!(summary.dispatched, 0);
        assert_eq!(w.db.write_count(), writes);
    }

    #[tokio::test]
    async fn test_renotify_after_interval() {
        let w = world();
        w.ido.host("db01", 1).unwrap();
        w.runner.run_pass().await.unwrap();

        let issue = w.runner.issues().load("prod", "db01", "").unwrap().unwrap();
        let next = issue.ts_next_notification().unwrap();
        w.clock.set(next);

        let summary = w.runner.run_pass().await.unwrap();
        assert_eq!(summary.dispatched, 1);
        let issue = w.runner.issues().load("prod", "db01", "").unwrap().unwrap();
        assert_eq!(issue.notification_count(), Some(2));
    }

    #[tokio::test]
    async fn test_recovered_and_vanished_objects_are_closed() {
        let w = world();
        let web01 = w.ido.host("web01", 0).unwrap();
        let http = w.ido.service(web01, "web01", "http", 2).unwrap();
        let db01 = w.ido.host("db01", 1).unwrap();
        w.runner.run_pass().await.unwrap();
        assert_eq!(w.runner.issues().count_for_cell("prod").unwrap(), 2);

        w.ido
            .execute(
                "UPDATE icinga_servicestatus SET current_state = 0, last_hard_state = 0
                 WHERE service_object_id = ?1",
                http,
            )
            .unwrap();
        w.ido
            .execute("DELETE FROM icinga_objects WHERE object_id = ?1", db01)
            .unwrap();

        let summary = w.runner.run_pass().await.unwrap();
        assert_eq!(summary.problems, 0);
        assert_eq!(summary.closed, 2);
        assert_eq!(w.runner.issues().count_for_cell("prod").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acknowledged_problem_stays_open_but_quiet() {
        let w = world();
        let db01 = w.ido.host("db01", 1).unwrap();
        w.runner.run_pass().await.unwrap();

        w.ido
            .execute(
                "UPDATE icinga_hoststatus SET problem_has_been_acknowledged = 1
                 WHERE host_object_id = ?1",
                db01,
            )
            .unwrap();
        let issue = w.runner.issues().load("prod", "db01", "").unwrap().unwrap();
        w.clock.set(issue.ts_next_notification().unwrap() + 1);

        let summary = w.runner.run_pass().await.unwrap();
        assert_eq!(summary.problems, 0);
        assert_eq!(summary.closed, 0);
        assert_eq!(summary.dispatched, 0);
        let issue = w.runner.issues().load("prod", "db01", "").unwrap().unwrap();
        assert!(!issue.is_relevant());
        assert_eq!(issue.notification_count(), Some(1));
    }

    #[tokio::test]
    async fn test_failing_notifier_is_counted_and_rescheduled() {
        let w = world();
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "echo 'cell unreachable'\nexit 1\n").unwrap();
        let mut settings = CellSettings::named("prod");
        settings.notifier.program = "/bin/sh".into();
        settings.notifier.args = vec![script.display().to_string()];
        let runner = CellRunner::new(
            Arc::new(RuleCellConfig::new(settings)),
            Arc::new(w.ido.open_ido().unwrap()),
            w.db.clone(),
            NotificationScheduler::new(w.clock.clone()),
        );

        w.ido.host("db01", 1).unwrap();
        let summary = runner.run_pass().await.unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.failed, 1);

        let issue = runner.issues().load("prod", "db01", "").unwrap().unwrap();
        assert_eq!(issue.notification_count(), Some(1));
        assert!(!runner.scheduler.is_due(&issue, w.clock.now_ms()));
    }

    /// Two stored issues that are due now.
    fn due_issues(w: &World) -> Vec<Issue> {
        let now = w.clock.now_ms();
        ["web01", "db01"]
            .into_iter()
            .map(|host| {
                let row = crate::test_support::service_row(host, "http", "CRITICAL");
                let mut issue = w.runner.issues().reconcile(&row, w.runner.cell.as_ref()).unwrap();
                w.runner.scheduler.schedule_next(&mut issue, Some(now)).unwrap();
                w.runner.issues().store(&mut issue).unwrap();
                issue
            })
            .collect()
    }

    #[tokio::test]
    async fn test_issue_deleted_during_dispatch_is_stored_again() {
        let w = world();
        let due = due_issues(&w);
        w.db
            .lock()
            .unwrap()
            .execute("DELETE FROM bem_issue WHERE host_name = 'db01'", [])
            .unwrap();

        let mut summary = PassSummary::default();
        w.runner.dispatch_all(due, &mut summary).await.unwrap();
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.failed, 0);

        let now = w.clock.now_ms();
        for host in ["web01", "db01"] {
            let issue = w.runner.issues().load("prod", host, "http").unwrap().unwrap();
            assert_eq!(issue.notification_count(), Some(1), "{host}");
            assert!(!w.runner.scheduler.is_due(&issue, now), "{host}");
        }
    }

    #[tokio::test]
    async fn test_bookkeeping_error_does_not_stop_other_issues() {
        let w = world();
        let due = due_issues(&w);
        w.db
            .lock()
            .unwrap()
            .execute_batch("ALTER TABLE bem_issue RENAME TO bem_issue_saved")
            .unwrap();

        let mut summary = PassSummary::default();
        let err = w.runner.dispatch_all(due, &mut summary).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(NotificationLog::new(w.db.clone()).recent(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recheck_uses_monitoring_names() {
        let w = world_with(|settings| {
            settings
                .fields
                .insert("host".into(), "{host.vars.fqdn}".into());
        });
        let db01 = w.ido.host("db01", 1).unwrap();
        w.ido.var(db01, "fqdn", "db01.example.com").unwrap();
        w.runner.run_pass().await.unwrap();
        assert!(w.runner.issues().load("prod", "db01.example.com", "").unwrap().is_some());

        w.ido
            .execute(
                "UPDATE icinga_hoststatus SET problem_has_been_acknowledged = 1
                 WHERE host_object_id = ?1",
                db01,
            )
            .unwrap();
        let summary = w.runner.run_pass().await.unwrap();
        assert_eq!(summary.problems, 0);
        assert_eq!(summary.closed, 0);

        let issue = w.runner.issues().load("prod", "db01.example.com", "").unwrap().unwrap();
        assert!(!issue.is_relevant());
        assert_eq!(issue.monitored_object(), ("db01", None));
    }
}
