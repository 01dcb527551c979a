//! Change detection, table reconciliation and poll orchestration for the depot monitor.

mod config;
mod detector;
mod driver;
mod observer;
mod queries;
mod synchronizer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dmon_realtime::{ChangeNotifier, NotifierConfig, WebSocketTransport};
use dmon_report::{ReportError, ReportParser};
use dmon_storage::{FetchError, HttpFetcher, StoreClient, StoreError, TableStore};
use thiserror::Error;
use tracing::info;

pub use config::{
    derive_realtime_url, load_monitor_file, ExportSettings, MonitorConfig, MonitorFile,
    MONITOR_FILE,
};
pub use detector::{content_hash, ChangeDetector};
pub use driver::{DriverSettings, ExportSource, HttpExportSource, PollDriver, TickOutcome};
pub use observer::{LoggingObserver, RecordForwarder, SyncObserver};
pub use queries::{QueryError, RecordQueries, SearchHit, TableStat, DEFAULT_RECENT_LIMIT};
pub use synchronizer::{
    CycleReport, SyncOptions, SyncState, SyncStep, TableOutcome, TableStatus, TableSynchronizer,
};

pub const CRATE_NAME: &str = "dmon-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync aborted for `{table}` during {step}: {source}")]
    Abort {
        table: String,
        step: SyncStep,
        source: StoreError,
    },
    #[error("sync abandoned for `{table}` before {step}")]
    Abandoned { table: String, step: SyncStep },
    #[error("export fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("poll cycle exceeded {0:?}")]
    Timeout(Duration),
    #[error("poll cycle task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Conditions escalated to the operator on first occurrence.
    pub fn is_critical(&self) -> bool {
        match self {
            SyncError::Report(_) => true,
            SyncError::Store(err) | SyncError::Abort { source: err, .. } => {
                err.is_connection_exhausted()
            }
            _ => false,
        }
    }
}

/// Fully wired monitor: store client, synchronizer, poll driver and query surface.
pub struct MonitorRuntime {
    pub config: MonitorConfig,
    pub file: MonitorFile,
    pub store: Arc<StoreClient>,
    pub synchronizer: Arc<TableSynchronizer>,
    pub driver: Arc<PollDriver>,
    pub queries: RecordQueries,
    pub observer: Arc<dyn SyncObserver>,
}

impl MonitorRuntime {
    pub fn build(config: MonitorConfig, observer: Arc<dyn SyncObserver>) -> Result<Self> {
        let file = load_monitor_file(&config.workspace_root)?;
        let registry = file.registry();

        let store = Arc::new(
            StoreClient::new(config.store_config()).context("creating store client")?,
        );
        let table_store: Arc<dyn TableStore> = store.clone();
        let synchronizer = Arc::new(
            TableSynchronizer::new(table_store.clone(), registry.clone(), observer.clone())
                .with_options(SyncOptions {
                    clear_absent_sections: file.clear_absent_sections,
                }),
        );

        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let source = Arc::new(HttpExportSource::new(
            fetcher,
            config.export_url.clone(),
            file.export.clone(),
        ));
        let parser = ReportParser::new(registry.names()).with_columns(file.columns);
        let driver = Arc::new(PollDriver::new(
            source,
            table_store.clone(),
            synchronizer.clone(),
            observer.clone(),
            parser,
            file.cleaning.clone(),
            DriverSettings {
                poll_interval: config.poll_interval,
                cycle_timeout: config.cycle_timeout,
                failure_threshold: config.failure_threshold,
            },
        ));
        let queries = RecordQueries::new(table_store, registry);

        Ok(Self {
            config,
            file,
            store,
            synchronizer,
            driver,
            queries,
            observer,
        })
    }

    /// Connects the realtime listener and forwards every registered table's inserts
    /// to the observer.
    pub async fn start_notifier(&self) -> ChangeNotifier {
        let url = format!(
            "{}?apikey={}",
            self.config.realtime_url, self.config.store_anon_key
        );
        let notifier = ChangeNotifier::new(
            Arc::new(WebSocketTransport::new(url)),
            NotifierConfig::default(),
        );
        let forwarder = Arc::new(RecordForwarder::new(self.observer.clone()));
        for table in self.synchronizer.registry().names() {
            notifier.subscribe(table, forwarder.clone()).await;
        }
        info!(
            tables = self.synchronizer.registry().tables.len(),
            "realtime notifier subscribed"
        );
        notifier
    }
}

pub async fn run_sync_once_from_env() -> Result<CycleReport> {
    let runtime = MonitorRuntime::build(MonitorConfig::from_env(), Arc::new(LoggingObserver))?;
    let missing = runtime.synchronizer.verify_tables().await;
    if !missing.is_empty() {
        tracing::warn!(?missing, "registered tables missing from store");
    }
    match runtime.driver.tick().await {
        TickOutcome::Completed(report) => Ok(report),
        TickOutcome::Skipped => anyhow::bail!("a poll cycle is already running"),
        TickOutcome::Failed(err) => anyhow::bail!("poll cycle failed: {err}"),
    }
}
