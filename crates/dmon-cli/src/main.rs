use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dmon_storage::TableStore;
use dmon_sync::{LoggingObserver, MonitorConfig, MonitorRuntime};
use dmon_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "dmon-cli")]
#[command(about = "Depot order monitor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll loop, realtime listener and store health monitor until ctrl-c.
    Run,
    /// A single fetch -> parse -> synchronize cycle.
    SyncOnce,
    /// Look up a BRV number across every status table.
    Search { brv: String },
    /// Newest rows of one status table.
    Recent {
        table: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Row counts per status table.
    Stats,
    /// Read-only JSON API.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await?,
        Commands::SyncOnce => {
            let report = dmon_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} tables={} failed={} inserted={} new={}",
                report.run_id,
                report.tables.len(),
                report.failed().count(),
                report.total_inserted(),
                report.total_new()
            );
        }
        Commands::Search { brv } => {
            let runtime = build_runtime()?;
            let hits = runtime.queries.search_by_brv(&brv).await?;
            print_json(&hits)?;
        }
        Commands::Recent { table, limit } => {
            let runtime = build_runtime()?;
            let rows = runtime.queries.recent(&table, limit).await?;
            print_json(&rows)?;
        }
        Commands::Stats => {
            let runtime = build_runtime()?;
            print_json(&runtime.queries.table_stats().await)?;
        }
        Commands::Serve { bind } => {
            let runtime = build_runtime()?;
            let bind = bind.unwrap_or_else(|| runtime.config.bind.clone());
            let store: Arc<dyn TableStore> = runtime.store.clone();
            dmon_web::serve(&bind, AppState::new(runtime.queries.clone(), store)).await?;
        }
    }

    Ok(())
}

fn build_runtime() -> Result<MonitorRuntime> {
    MonitorRuntime::build(MonitorConfig::from_env(), Arc::new(LoggingObserver))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

async fn run() -> Result<()> {
    let runtime = build_runtime()?;
    let cancel = CancellationToken::new();

    let missing = runtime.synchronizer.verify_tables().await;
    if !missing.is_empty() {
        warn!(?missing, "registered tables missing from store");
    }

    let health = runtime
        .store
        .clone()
        .spawn_health_monitor(Duration::from_secs(300), cancel.clone());
    let notifier = runtime.start_notifier().await;

    let scheduler = runtime
        .driver
        .maybe_build_scheduler(runtime.config.scheduler_enabled, &runtime.config.poll_cron)
        .await?;
    let poller = match scheduler {
        Some(mut sched) => {
            sched.start().await.context("starting scheduler")?;
            info!(cron = %runtime.config.poll_cron, "poll scheduler started");
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler shutdown failed");
                }
            })
        }
        None => tokio::spawn(runtime.driver.clone().run(cancel.clone())),
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    cancel.cancel();
    notifier.shutdown().await;
    let _ = poller.await;
    let _ = health.await;
    runtime.store.close().await;
    Ok(())
}
