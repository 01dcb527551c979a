use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use dmon_report::{parse_export, CleaningRules, ReportParser};
use dmon_storage::{HttpFetcher, TableStore};
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ExportSettings;
use crate::observer::SyncObserver;
use crate::synchronizer::{CycleReport, TableSynchronizer};
use crate::SyncError;

/// Supplies the raw export payload for one cycle.
#[async_trait]
pub trait ExportSource: Send + Sync {
    async fn fetch_export(&self, run_id: Uuid) -> Result<Vec<u8>, SyncError>;
}

pub struct HttpExportSource {
    fetcher: HttpFetcher,
    url: String,
    settings: ExportSettings,
}

impl HttpExportSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>, settings: ExportSettings) -> Self {
        Self {
            fetcher,
            url: url.into(),
            settings,
        }
    }
}

#[async_trait]
impl ExportSource for HttpExportSource {
    async fn fetch_export(&self, run_id: Uuid) -> Result<Vec<u8>, SyncError> {
        let params = self.settings.request_params(Local::now().date_naive());
        info!(%run_id, url = %self.url, "fetching daily order export");
        let fetched = self.fetcher.fetch_bytes(run_id, &self.url, &params).await?;
        Ok(fetched.body)
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub poll_interval: Duration,
    pub cycle_timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            cycle_timeout: Duration::from_secs(300),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(CycleReport),
    /// A previous cycle still holds the single-flight guard.
    Skipped,
    Failed(String),
}

struct FlightGuard(Arc<AtomicBool>);

impl FlightGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic fetch -> parse -> synchronize driver. Never runs two cycles at once.
pub struct PollDriver {
    source: Arc<dyn ExportSource>,
    store: Arc<dyn TableStore>,
    synchronizer: Arc<TableSynchronizer>,
    observer: Arc<dyn SyncObserver>,
    parser: ReportParser,
    rules: CleaningRules,
    settings: DriverSettings,
    running: Arc<AtomicBool>,
    consecutive_failures: AtomicU32,
}

impl PollDriver {
    pub fn new(
        source: Arc<dyn ExportSource>,
        store: Arc<dyn TableStore>,
        synchronizer: Arc<TableSynchronizer>,
        observer: Arc<dyn SyncObserver>,
        parser: ReportParser,
        rules: CleaningRules,
        settings: DriverSettings,
    ) -> Self {
        Self {
            source,
            store,
            synchronizer,
            observer,
            parser,
            rules,
            settings,
            running: Arc::new(AtomicBool::new(false)),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Runs one cycle unless one is already in flight. A cycle that outlives the
    /// timeout is counted as failed and abandoned: requests already in flight
    /// finish, but no further step starts and its task keeps the guard until then.
    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        let Some(guard) = FlightGuard::try_acquire(&self.running) else {
            info!("previous poll cycle still running, skipping tick");
            return TickOutcome::Skipped;
        };

        let run_id = Uuid::new_v4();
        let driver = self.clone();
        let cancel = CancellationToken::new();
        let abandon = cancel.clone();
        let mut task = tokio::spawn(
            async move {
                let _guard = guard;
                driver.run_cycle(run_id, &cancel).await
            }
            .instrument(info_span!("poll_cycle", %run_id)),
        );

        let result = match tokio::time::timeout(self.settings.cycle_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SyncError::Task(join_err.to_string())),
            Err(_) => {
                abandon.cancel();
                warn!(%run_id, timeout = ?self.settings.cycle_timeout, "poll cycle timed out");
                Err(SyncError::Timeout(self.settings.cycle_timeout))
            }
        };

        match result {
            Ok(report) => {
                if report.all_failed() {
                    self.record_failure().await;
                } else {
                    self.consecutive_failures.store(0, Ordering::Release);
                }
                TickOutcome::Completed(report)
            }
            Err(err) => {
                error!(%run_id, error = %err, "poll cycle failed");
                if err.is_critical() {
                    self.observer.on_critical_error(&err.to_string()).await;
                }
                self.record_failure().await;
                TickOutcome::Failed(err.to_string())
            }
        }
    }

    async fn run_cycle(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, SyncError> {
        self.store.ping().await?;
        let body = self.source.fetch_export(run_id).await?;
        if cancel.is_cancelled() {
            info!(%run_id, "export arrived after timeout, discarding");
            return Err(SyncError::Timeout(self.settings.cycle_timeout));
        }
        let sections = parse_export(&body, &self.rules, &self.parser)?;
        info!(
            %run_id,
            sections = sections.len(),
            records = sections.values().map(Vec::len).sum::<usize>(),
            "parsed export"
        );
        Ok(self.synchronizer.sync_cycle_until(run_id, &sections, cancel).await)
    }

    async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let threshold = self.settings.failure_threshold.max(1);
        if failures % threshold == 0 {
            self.observer
                .on_critical_error(&format!("{failures} consecutive poll cycles failed"))
                .await;
        }
    }

    /// Ticks on the poll interval until `cancel` fires. The first tick runs immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("poll driver stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let TickOutcome::Completed(report) = self.tick().await {
                        info!(
                            run_id = %report.run_id,
                            failed = report.failed().count(),
                            "poll cycle complete"
                        );
                    }
                }
            }
        }
    }

    /// Cron-driven alternative to [`PollDriver::run`], built only when enabled.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        enabled: bool,
        cron: &str,
    ) -> Result<Option<JobScheduler>> {
        if !enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let driver = self.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let driver = driver.clone();
            Box::pin(async move {
                if let TickOutcome::Failed(err) = driver.tick().await {
                    warn!(error = %err, "scheduled poll cycle failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
