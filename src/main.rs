//! # BEM: monitoring to BMC Event Manager bridge
//!
//! Usage:
//!   bem run                          # Reconcile all enabled cells forever
//!   bem once                         # One pass per cell, then exit
//!   bem issues --cell prod           # Stored issues
//!   bem notifications --limit 50     # Recent notifier runs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bem_core::{BemConfig, CellConfig, RuleCellConfig};
use bem_ido::IdoDb;
use bem_scheduler::{
    BemDb, CellRunner, IssueStore, NotificationLog, NotificationScheduler, describe_exit_code,
    spawn_cell_loop,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bem", version, about = "📟 BEM: monitoring problems to BMC Event Manager")]
struct Cli {
    /// Config file (default: ~/.bem/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile every enabled cell on its poll interval
    Run,
    /// Run a single pass per enabled cell
    Once,
    /// List stored issues
    Issues {
        #[arg(long)]
        cell: Option<String>,
    },
    /// Show recent notifications
    Notifications {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "bem=debug" } else { "bem=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => BemConfig::load_from(path),
        None => BemConfig::load(),
    }
    .context("loading configuration")?;

    let db = BemDb::open(&config.state_db_path())
        .with_context(|| format!("opening {}", config.state_db_path().display()))?;

    match cli.command {
        Command::Run => run(&config, db).await,
        Command::Once => once(&config, db).await,
        Command::Issues { cell } => list_issues(db, cell.as_deref()),
        Command::Notifications { limit } => list_notifications(db, limit),
    }
}

fn runners(config: &BemConfig, db: &BemDb) -> Result<Vec<Arc<CellRunner>>> {
    let ido_path = config.ido_db_path();
    let ido = Arc::new(
        IdoDb::open(&ido_path).with_context(|| format!("opening {}", ido_path.display()))?,
    );
    let scheduler = NotificationScheduler::with_system_clock();

    let runners: Vec<_> = config
        .enabled_cells()
        .map(|settings| {
            let cell: Arc<dyn CellConfig> = Arc::new(RuleCellConfig::new(settings.clone()));
            Arc::new(
                CellRunner::new(cell, ido.clone(), db.clone(), scheduler.clone())
                    .with_max_parallel(config.max_parallel_dispatch),
            )
        })
        .collect();

    if runners.is_empty() {
        anyhow::bail!("no enabled cells configured");
    }
    Ok(runners)
}

async fn run(config: &BemConfig, db: BemDb) -> Result<()> {
    let every = Duration::from_secs(config.poll_interval_secs.max(1));
    println!("📟 BEM v{}", env!("CARGO_PKG_VERSION"));

    for runner in runners(config, &db)? {
        println!("   Cell: {}", runner.cell_name());
        tokio::spawn(spawn_cell_loop(runner, every));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 shutting down");
    Ok(())
}

async fn once(config: &BemConfig, db: BemDb) -> Result<()> {
    for runner in runners(config, &db)? {
        let summary = runner
            .run_pass()
            .await
            .with_context(|| format!("pass for cell '{}'", runner.cell_name()))?;
        println!(
            "{:<16} problems={} stored={} closed={} notified={} failed={}",
            runner.cell_name(),
            summary.problems,
            summary.stored,
            summary.closed,
            summary.dispatched,
            summary.failed
        );
    }
    Ok(())
}

fn list_issues(db: BemDb, cell: Option<&str>) -> Result<()> {
    let store = IssueStore::new(db);
    let issues = match cell {
        Some(cell) => store.list_for_cell(cell)?,
        None => store.list_all()?,
    };
    if issues.is_empty() {
        println!("No issues.");
        return Ok(());
    }

    println!(
        "{:<12} {:<24} {:<24} {:<9} {:<9} {:>5}  {}",
        "CELL", "HOST", "OBJECT", "SEVERITY", "RELEVANT", "SENT", "NEXT"
    );
    for issue in &issues {
        println!(
            "{:<12} {:<24} {:<24} {:<9} {:<9} {:>5}  {}",
            issue.cell_name(),
            issue.host_name(),
            issue.object_name(),
            issue.severity().map(|s| s.as_str()).unwrap_or("-"),
            if issue.is_relevant() { "yes" } else { "no" },
            issue.notification_count().unwrap_or(0),
            format_ts(issue.ts_next_notification())
        );
    }
    Ok(())
}

fn list_notifications(db: BemDb, limit: usize) -> Result<()> {
    let log = NotificationLog::new(db);
    let notifications = log.recent(limit)?;
    if notifications.is_empty() {
        println!("No notifications.");
        return Ok(());
    }

    for n in &notifications {
        let code = n.exit_code().unwrap_or(255);
        println!(
            "{} {} {}/{} [{}] exit {} ({}) {}ms event={}",
            n.id().unwrap_or_default(),
            format_ts(n.ts_notification()),
            n.host_name(),
            n.object_name(),
            n.severity().map(|s| s.as_str()).unwrap_or("-"),
            code,
            describe_exit_code(code),
            n.duration_ms().unwrap_or_default(),
            n.bem_event_id().unwrap_or("-")
        );
        if let Some(cmd) = n.command_line() {
            println!("    $ {cmd}");
        }
    }
    Ok(())
}

fn format_ts(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}
