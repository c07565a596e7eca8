//! Notification dispatch: runs the cell's notifier program for an issue.
//!
//! The program is started directly (no shell) with stdin closed. Stdout and
//! stderr are forwarded by two reader tasks over one channel, so the result
//! handler sees a single stream in arrival order. A run that outlives its
//! deadline gets SIGTERM, then SIGKILL after a grace period.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bem_core::{BemError, CellConfig, Clock, NotifierContext, Result, SystemClock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::issue::Issue;
use crate::notify::{Notification, NotificationLog};
use crate::result::ProcessResultHandler;

const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct NotificationDispatcher {
    log: NotificationLog,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl NotificationDispatcher {
    pub fn new(log: NotificationLog) -> Self {
        Self {
            log,
            clock: Arc::new(SystemClock),
            grace: KILL_GRACE,
        }
    }

    /// Clock used for the recorded start time and duration.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Time between SIGTERM and SIGKILL once the deadline passed.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run the notifier for `issue` and store the resulting notification.
    pub async fn dispatch(&self, issue: &Issue, cell: &dyn CellConfig) -> Result<Notification> {
        let fields = issue.attributes().clone();
        let ctx = NotifierContext {
            cell: cell.name(),
            host: issue.host_name(),
            object: issue.object_name(),
            severity: issue.severity(),
            fields: &fields,
        };
        let argv = cell.notifier_command(&ctx);
        let notification = Notification::for_issue(issue)?;
        tracing::info!(
            "📣 [{}] notifying {}/{} ({})",
            cell.name(),
            issue.host_name(),
            issue.object_name(),
            issue.severity().map(|s| s.as_str()).unwrap_or("?")
        );
        self.run(&argv, cell.notifier_timeout(), notification).await
    }

    /// Run `argv` (program first) and finalize `notification` with its outcome.
    pub async fn run(
        &self,
        argv: &[String],
        timeout: Duration,
        notification: Notification,
    ) -> Result<Notification> {
        let mut handler = ProcessResultHandler::new(notification, self.log.clone());
        handler.start(&shell_join(argv), self.clock.now_ms())?;

        let Some((program, args)) = argv.split_first() else {
            handler.add_output(b"empty notifier command");
            return handler.finish(None, None, None, self.clock.now_ms());
        };

        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let err = BemError::ProcessDispatch(format!("{program}: {e}"));
                tracing::warn!("⚠️ {err}");
                handler.add_output(err.to_string().as_bytes());
                return handler.finish(None, None, None, self.clock.now_ms());
            }
        };
        let pid = child.id();

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward(stderr, tx.clone()));
        }
        drop(tx);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut terminated = false;
        let mut killed = false;

        let status = loop {
            tokio::select! {
                Some(chunk) = rx.recv() => {
                    handler.add_output(&chunk);
                }
                status = child.wait() => break status,
                _ = &mut deadline, if !killed => {
                    if terminated {
                        tracing::warn!("⚠️ {program} ignored SIGTERM, killing it");
                        killed = true;
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("⚠️ failed to kill {program}: {e}");
                        }
                    } else {
                        tracing::warn!("⚠️ {program} exceeded {timeout:?}, terminating");
                        terminated = true;
                        terminate(&mut child, pid);
                        deadline.as_mut().reset(tokio::time::Instant::now() + self.grace);
                    }
                }
            }
        };

        // Pipes may still hold output written right before exit.
        let drain = async {
            while let Some(chunk) = rx.recv().await {
                handler.add_output(&chunk);
            }
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            tracing::debug!("{program} left its output pipes open");
        }

        match status {
            Ok(status) => handler.finish(status.code(), exit_signal(&status), pid, self.clock.now_ms()),
            Err(e) => {
                handler.add_output(format!("\nwait failed: {e}").as_bytes());
                handler.finish(None, None, pid, self.clock.now_ms())
            }
        }
    }
}

async fn forward<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(_child: &mut tokio::process::Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) has no memory safety preconditions; the pid belongs
        // to a child we have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut tokio::process::Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Render argv as a command line a POSIX shell would split back the same way.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::BemDb;
    use crate::store::IssueStore;
    use crate::test_support::service_row;
    use bem_core::{CellSettings, RuleCellConfig};

    struct Harness {
        store: IssueStore,
        log: NotificationLog,
        _dir: tempfile::TempDir,
        script: std::path::PathBuf,
    }

    impl Harness {
        fn new(script_body: &str) -> Self {
            let db = BemDb::open_in_memory().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("notifier.sh");
            std::fs::write(&script, script_body).unwrap();
            Self {
                store: IssueStore::new(db.clone()),
                log: NotificationLog::new(db),
                _dir: dir,
                script,
            }
        }

        fn cell(&self, args: &[&str], timeout_secs: u64) -> RuleCellConfig {
            let mut settings = CellSettings::named("prod");
            settings.notifier.program = "/bin/sh".into();
            settings.notifier.args = std::iter::once(self.script.display().to_string())
                .chain(args.iter().map(|a| a.to_string()))
                .collect();
            settings.notifier.timeout_secs = timeout_secs;
            RuleCellConfig::new(settings)
        }

        fn issue(&self, cell: &RuleCellConfig) -> Issue {
            let mut issue = self
                .store
                .reconcile(&service_row("web01", "http", "CRITICAL"), cell)
                .unwrap();
            self.store.store(&mut issue).unwrap();
            issue
        }
    }

    #[tokio::test]
    async fn test_dispatch_captures_output_and_event_id() {
        let h = Harness::new(
            "echo \"args: $*\"\necho 'warn' >&2\necho 'Message #1 - Evtid = 4711'\nexit 0\n",
        );
        let cell = h.cell(&["{severity}", "{slots}"], 10);
        let issue = h.issue(&cell);

        let n = NotificationDispatcher::new(h.log.clone())
            .dispatch(&issue, &cell)
            .await
            .unwrap();

        assert_eq!(n.exit_code(), Some(0));
        assert_eq!(n.bem_event_id(), Some("4711"));
        assert!(n.output().contains("args: CRITICAL host=web01;object=http"));
        assert!(n.output().contains("warn"));
        assert!(n.pid().is_some());
        assert!(n.command_line().unwrap().starts_with("/bin/sh "));
        assert!(n.command_line().unwrap().contains("'host=web01;object=http'"));
        assert_eq!(h.log.recent(5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_records_failure_code() {
        let h = Harness::new("echo 'no route to cell'\nexit 3\n");
        let cell = h.cell(&[], 10);
        let issue = h.issue(&cell);
        let n = NotificationDispatcher::new(h.log.clone())
            .dispatch(&issue, &cell)
            .await
            .unwrap();
        assert_eq!(n.exit_code(), Some(3));
        assert!(!n.succeeded());
        assert_eq!(n.bem_event_id(), None);
    }

    #[tokio::test]
    async fn test_deadline_terminates_process() {
        let h = Harness::new("echo started\nexec sleep 30\n");
        let cell = h.cell(&[], 1);
        let issue = h.issue(&cell);
        let started = std::time::Instant::now();
        let n = NotificationDispatcher::new(h.log.clone())
            .with_grace(Duration::from_secs(2))
            .dispatch(&issue, &cell)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(n.exit_code(), Some(143));
        assert!(n.output().contains("started"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded() {
        let h = Harness::new("");
        let mut settings = CellSettings::named("prod");
        settings.notifier.program = "/nonexistent/msend".into();
        let cell = RuleCellConfig::new(settings);
        let issue = h.issue(&cell);

        let n = NotificationDispatcher::new(h.log.clone())
            .dispatch(&issue, &cell)
            .await
            .unwrap();
        assert_eq!(n.exit_code(), Some(255));
        assert_eq!(n.pid(), None);
        assert!(n.output().contains("/nonexistent/msend"));
        assert!(n.id().is_some());
    }

    #[test]
    fn test_shell_join() {
        let argv: Vec<String> = ["msend", "-b", "a=b;c=d", "it's", ""]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(shell_join(&argv), r"msend -b 'a=b;c=d' 'it'\''s' ''");
    }
}
