use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dmon_core::{HistoryEntry, LiveRow, Record, StagedNewRecord, TableRegistry, TableSpec};
use dmon_storage::{StoreError, TableStore};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::detector::{content_hash, decode_record, row_hash, ChangeDetector};
use crate::observer::SyncObserver;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    Detecting,
    BackingUp,
    Clearing,
    Inserting,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStep {
    Detect,
    Stage,
    Backup,
    Clear,
    Insert,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStep::Detect => "detect",
            SyncStep::Stage => "stage",
            SyncStep::Backup => "backup",
            SyncStep::Clear => "clear",
            SyncStep::Insert => "insert",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableStatus {
    Done,
    Failed,
    /// No section this cycle; the live table was not touched.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub status: TableStatus,
    /// Last state reached. `Failed` carries the step in `error`.
    pub state: SyncState,
    pub new_records: usize,
    pub archived: usize,
    pub inserted: usize,
    pub error: Option<String>,
    /// Detection or staging failure. The live table is still reloaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_error: Option<String>,
    #[serde(skip)]
    pub connection_exhausted: bool,
}

impl TableOutcome {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            status: TableStatus::Done,
            state: SyncState::Idle,
            new_records: 0,
            archived: 0,
            inserted: 0,
            error: None,
            staging_error: None,
            connection_exhausted: false,
        }
    }

    fn enter(&mut self, state: SyncState) {
        debug!(table = %self.table, ?state, "table sync state");
        self.state = state;
    }

    fn staging_failed(&mut self, step: SyncStep, err: StoreError) {
        warn!(
            table = %self.table,
            %step,
            error = %err,
            "new record staging failed, continuing with live table"
        );
        self.connection_exhausted |= err.is_connection_exhausted();
        self.staging_error = Some(format!("{step}: {err}"));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableOutcome>,
}

impl CycleReport {
    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.table == table)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TableOutcome> {
        self.tables.iter().filter(|t| t.status == TableStatus::Failed)
    }

    /// True when at least one table was attempted and every attempted table failed.
    pub fn all_failed(&self) -> bool {
        let attempted = self
            .tables
            .iter()
            .filter(|t| t.status != TableStatus::Skipped)
            .count();
        attempted > 0 && self.failed().count() == attempted
    }

    pub fn total_inserted(&self) -> usize {
        self.tables.iter().map(|t| t.inserted).sum()
    }

    pub fn total_new(&self) -> usize {
        self.tables.iter().map(|t| t.new_records).sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub clear_absent_sections: bool,
}

/// Reconciles each registered table against this cycle's section records:
/// detect and stage (trackable tables) -> backup -> clear -> insert.
pub struct TableSynchronizer {
    store: Arc<dyn TableStore>,
    detector: ChangeDetector,
    registry: TableRegistry,
    observer: Arc<dyn SyncObserver>,
    options: SyncOptions,
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl TableSynchronizer {
    pub fn new(
        store: Arc<dyn TableStore>,
        registry: TableRegistry,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        let locks = registry
            .tables
            .iter()
            .map(|t| (t.name.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            detector: ChangeDetector::new(store.clone()),
            store,
            registry,
            observer,
            options: SyncOptions::default(),
            locks,
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub async fn sync_cycle(&self, sections: &BTreeMap<String, Vec<Record>>) -> CycleReport {
        self.sync_cycle_with_id(Uuid::new_v4(), sections).await
    }

    pub async fn sync_cycle_with_id(
        &self,
        run_id: Uuid,
        sections: &BTreeMap<String, Vec<Record>>,
    ) -> CycleReport {
        self.sync_cycle_until(run_id, sections, &CancellationToken::new()).await
    }

    /// Runs every registered table concurrently. Tables never block each other.
    /// Once `cancel` fires no table starts another step, observers are not
    /// notified, and the cycle is not escalated.
    pub async fn sync_cycle_until(
        &self,
        run_id: Uuid,
        sections: &BTreeMap<String, Vec<Record>>,
        cancel: &CancellationToken,
    ) -> CycleReport {
        let started_at = Utc::now();
        for name in sections.keys() {
            if self.registry.get(name).is_none() {
                warn!(%run_id, section = %name, "section has no registered table, ignoring");
            }
        }

        let tables = join_all(self.registry.tables.iter().map(|spec| {
            let records = sections.get(&spec.name).map(Vec::as_slice);
            let span = info_span!("table_sync", %run_id, table = %spec.name);
            self.sync_table_until(spec, records, cancel).instrument(span)
        }))
        .await;

        let report = CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            tables,
        };
        info!(
            %run_id,
            tables = report.tables.len(),
            failed = report.failed().count(),
            inserted = report.total_inserted(),
            new = report.total_new(),
            "sync cycle finished"
        );

        if cancel.is_cancelled() {
            warn!(%run_id, "sync cycle abandoned");
        } else if report.all_failed() {
            self.observer
                .on_critical_error(&format!(
                    "sync cycle {run_id}: all {} attempted tables failed",
                    report.failed().count()
                ))
                .await;
        } else if report.tables.iter().any(|t| t.connection_exhausted) {
            self.observer
                .on_critical_error(&format!(
                    "sync cycle {run_id}: store connection attempts exhausted"
                ))
                .await;
        }
        report
    }

    /// One table's pipeline. `records` is `None` when the report had no section for it.
    pub async fn sync_table(&self, spec: &TableSpec, records: Option<&[Record]>) -> TableOutcome {
        self.sync_table_until(spec, records, &CancellationToken::new()).await
    }

    async fn sync_table_until(
        &self,
        spec: &TableSpec,
        records: Option<&[Record]>,
        cancel: &CancellationToken,
    ) -> TableOutcome {
        let lock = self
            .locks
            .get(&spec.name)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())));
        let _held = lock.lock().await;

        let mut outcome = TableOutcome::new(&spec.name);
        let records = match records {
            Some(records) => records,
            None if self.options.clear_absent_sections => &[],
            None => {
                debug!(table = %spec.name, "no section this cycle, leaving table untouched");
                outcome.status = TableStatus::Skipped;
                return outcome;
            }
        };

        match self.run_pipeline(spec, records, &mut outcome, cancel).await {
            Ok(()) => {
                outcome.enter(SyncState::Done);
                info!(
                    table = %spec.name,
                    archived = outcome.archived,
                    inserted = outcome.inserted,
                    new = outcome.new_records,
                    "table synchronized"
                );
            }
            Err(err) => {
                error!(
                    table = %spec.name,
                    state = ?outcome.state,
                    error = %err,
                    "table sync failed"
                );
                if let SyncError::Abort { source, .. } = &err {
                    outcome.connection_exhausted = source.is_connection_exhausted();
                }
                outcome.status = TableStatus::Failed;
                outcome.enter(SyncState::Failed);
                outcome.error = Some(err.to_string());
            }
        }
        outcome
    }

    async fn run_pipeline(
        &self,
        spec: &TableSpec,
        records: &[Record],
        outcome: &mut TableOutcome,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let abort = |step: SyncStep| {
            let table = spec.name.clone();
            move |source: StoreError| SyncError::Abort {
                table,
                step,
                source,
            }
        };
        let proceed = |step: SyncStep| {
            if cancel.is_cancelled() {
                Err(SyncError::Abandoned {
                    table: spec.name.clone(),
                    step,
                })
            } else {
                Ok(())
            }
        };

        // staging failures are recorded but never hold back the live table
        if spec.trackable && !records.is_empty() {
            proceed(SyncStep::Detect)?;
            outcome.enter(SyncState::Detecting);
            match self.detector.identify_new(spec, records).await {
                Ok(fresh) => {
                    proceed(SyncStep::Stage)?;
                    match self.replace_staged(spec, &fresh).await {
                        Ok(()) => {
                            proceed(SyncStep::Backup)?;
                            outcome.new_records = fresh.len();
                            self.observer.on_new_records(&spec.name, &fresh).await;
                        }
                        Err(err) => outcome.staging_failed(SyncStep::Stage, err),
                    }
                }
                Err(err) => outcome.staging_failed(SyncStep::Detect, err),
            }
        }

        proceed(SyncStep::Backup)?;
        outcome.enter(SyncState::BackingUp);
        outcome.archived = self.backup(spec).await.map_err(abort(SyncStep::Backup))?;

        proceed(SyncStep::Clear)?;
        outcome.enter(SyncState::Clearing);
        self.store
            .delete_all(&spec.name)
            .await
            .map_err(abort(SyncStep::Clear))?;

        proceed(SyncStep::Insert)?;
        outcome.enter(SyncState::Inserting);
        let now = Utc::now();
        let rows = records
            .iter()
            .map(|record| {
                to_row(&LiveRow {
                    record: record.clone(),
                    record_hash: content_hash(record),
                    created_at: now,
                    updated_at: now,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(abort(SyncStep::Insert))?;
        let batch = self.store.insert_rows(&spec.name, &rows).await;
        outcome.inserted = batch.inserted;
        if batch.is_partial() {
            warn!(
                table = %spec.name,
                inserted = batch.inserted,
                total = rows.len(),
                "partial batch insert"
            );
        }
        batch.into_result().map_err(abort(SyncStep::Insert))?;
        Ok(())
    }

    /// Staging holds only the latest detection pass.
    async fn replace_staged(&self, spec: &TableSpec, fresh: &[Record]) -> Result<(), StoreError> {
        let staging = spec.staging_table();
        self.store.delete_all(&staging).await?;
        let now = Utc::now();
        let rows = fresh
            .iter()
            .map(|record| {
                to_row(&StagedNewRecord {
                    record: record.clone(),
                    record_hash: content_hash(record),
                    detected_at: now,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.store.insert_rows(&staging, &rows).await.into_result()?;
        Ok(())
    }

    /// Appends every live row to history. Returns the number archived.
    async fn backup(&self, spec: &TableSpec) -> Result<usize, StoreError> {
        let live = self.store.select_all(&spec.name, "*").await?;
        if live.is_empty() {
            return Ok(0);
        }
        let archived_at = Utc::now();
        let rows = live
            .iter()
            .map(|row| {
                to_row(&HistoryEntry {
                    record: decode_record(row)?,
                    record_hash: Some(row_hash(row)?),
                    archived_at,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.store
            .insert_rows(&spec.history_table(), &rows)
            .await
            .into_result()
    }

    /// Probes every registered table and returns those the store reports missing.
    pub async fn verify_tables(&self) -> Vec<String> {
        let names: Vec<String> = self.registry.names().into_iter().map(String::from).collect();
        let results = self.store.probe_tables(&names).await;
        let mut missing = Vec::new();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(table = %name, "table verified"),
                Err(err) if err.is_missing_table() => {
                    warn!(table = %name, "table does not exist in store");
                    missing.push(name);
                }
                Err(err) => warn!(table = %name, error = %err, "table probe failed"),
            }
        }
        missing
    }
}

fn to_row<T: Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Decode {
        endpoint: "row".to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingObserver;
    use chrono::NaiveDate;
    use dmon_storage::{MemoryStore, StoreOp};
    use serde_json::json;

    fn record(brv: &str) -> Record {
        Record {
            order_date: NaiveDate::from_ymd_opt(2024, 3, 9),
            order_number: Some(format!("ORD-{brv}")),
            products: Some("PMS".into()),
            volume: Some(54000),
            ex_ref_price: Some(12.75),
            brv_number: Some(brv.into()),
            bdc: Some("STAR OIL".into()),
        }
    }

    fn live_row(brv: &str) -> JsonValue {
        let r = record(brv);
        json!({
            "order_date": "2024-03-09",
            "order_number": r.order_number,
            "products": "PMS",
            "volume": 54000,
            "ex_ref_price": 12.75,
            "brv_number": brv,
            "bdc": "STAR OIL",
            "record_hash": content_hash(&r),
            "created_at": "2024-03-09T08:00:00Z",
            "updated_at": "2024-03-09T08:00:00Z"
        })
    }

    fn registry(tables: &[TableSpec]) -> TableRegistry {
        TableRegistry {
            tables: tables.to_vec(),
        }
    }

    fn sections(entries: &[(&str, Vec<Record>)]) -> BTreeMap<String, Vec<Record>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn brvs(rows: &[JsonValue]) -> Vec<String> {
        let mut out: Vec<String> = rows
            .iter()
            .filter_map(|r| r["brv_number"].as_str().map(String::from))
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn trackable_table_runs_detect_backup_clear_insert_in_order() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("depot_manager", vec![live_row("AS1"), live_row("AS2")])
            .await;
        store
            .seed(
                "depot_manager_history",
                vec![json!({"brv_number": "AS1", "record_hash": content_hash(&record("AS1"))})],
            )
            .await;
        store
            .seed("depot_manager_new_records", vec![json!({"brv_number": "OLD"})])
            .await;
        let observer = Arc::new(RecordingObserver::default());
        let sync = TableSynchronizer::new(
            store.clone(),
            registry(&[TableSpec::new("depot_manager").trackable()]),
            observer.clone(),
        );

        let report = sync
            .sync_cycle(&sections(&[(
                "depot_manager",
                vec![record("AS1"), record("AS2"), record("AS3")],
            )]))
            .await;

        assert_eq!(
            store.operations().await,
            vec![
                "select:depot_manager_history",
                "delete:depot_manager_new_records",
                "insert:depot_manager_new_records",
                "select:depot_manager",
                "insert:depot_manager_history",
                "delete:depot_manager",
                "insert:depot_manager",
            ]
        );

        let outcome = report.outcome("depot_manager").unwrap();
        assert_eq!(outcome.status, TableStatus::Done);
        assert_eq!(outcome.state, SyncState::Done);
        assert_eq!((outcome.new_records, outcome.archived, outcome.inserted), (2, 2, 3));

        assert_eq!(brvs(&store.rows("depot_manager_new_records").await), vec!["AS2", "AS3"]);
        assert_eq!(brvs(&store.rows("depot_manager_history").await), vec!["AS1", "AS1", "AS2"]);
        let live = store.rows("depot_manager").await;
        assert_eq!(brvs(&live), vec!["AS1", "AS2", "AS3"]);
        assert_eq!(live[2]["record_hash"], content_hash(&record("AS3")));

        let calls = observer.new_records().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "depot_manager");
        assert_eq!(calls[0].1.len(), 2);
        assert!(observer.critical_errors().await.is_empty());
    }

    #[tokio::test]
    async fn failed_table_does_not_affect_others() {
        let store = Arc::new(MemoryStore::new());
        store.seed("loaded", vec![live_row("L1")]).await;
        store.seed("marked", vec![live_row("M1")]).await;
        store.fail("marked", StoreOp::Delete).await;
        let observer = Arc::new(RecordingObserver::default());
        let sync = TableSynchronizer::new(
            store.clone(),
            registry(&[TableSpec::new("loaded"), TableSpec::new("marked")]),
            observer.clone(),
        );

        let report = sync
            .sync_cycle(&sections(&[
                ("loaded", vec![record("L2")]),
                ("marked", vec![record("M2")]),
            ]))
            .await;

        let loaded = report.outcome("loaded").unwrap();
        assert_eq!(loaded.status, TableStatus::Done);
        assert_eq!(brvs(&store.rows("loaded").await), vec!["L2"]);

        let marked = report.outcome("marked").unwrap();
        assert_eq!(marked.status, TableStatus::Failed);
        assert_eq!(marked.state, SyncState::Failed);
        assert!(marked.error.as_deref().unwrap().contains("clear"));
        assert_eq!(brvs(&store.rows("marked").await), vec!["M1"]);
        assert_eq!(brvs(&store.rows("marked_history").await), vec!["M1"]);
        assert!(!store.operations().await.contains(&"insert:marked".to_string()));

        assert!(!report.all_failed());
        assert!(observer.critical_errors().await.is_empty());
    }

    #[tokio::test]
    async fn backup_failure_stops_before_clearing() {
        let store = Arc::new(MemoryStore::new());
        store.seed("loaded", vec![live_row("L1")]).await;
        store.fail("loaded_history", StoreOp::Insert).await;
        let observer = Arc::new(RecordingObserver::default());
        let sync = TableSynchronizer::new(
            store.clone(),
            registry(&[TableSpec::new("loaded")]),
            observer.clone(),
        );

        let report = sync
            .sync_cycle(&sections(&[("loaded", vec![record("L2")])]))
            .await;

        assert_eq!(report.outcome("loaded").unwrap().status, TableStatus::Failed);
        assert_eq!(brvs(&store.rows("loaded").await), vec!["L1"]);
        assert!(!store.operations().await.contains(&"delete:loaded".to_string()));
        assert!(report.all_failed());
        assert_eq!(observer.critical_errors().await.len(), 1);
    }

    #[tokio::test]
    async fn absent_section_leaves_table_untouched_unless_configured() {
        let store = Arc::new(MemoryStore::new());
        store.seed("marked", vec![live_row("M1")]).await;
        let tables = registry(&[TableSpec::new("loaded"), TableSpec::new("marked")]);
        let observer = Arc::new(RecordingObserver::default());
        let cycle = sections(&[("loaded", vec![record("L1")])]);

        let sync = TableSynchronizer::new(store.clone(), tables.clone(), observer.clone());
        let report = sync.sync_cycle(&cycle).await;
        assert_eq!(report.outcome("marked").unwrap().status, TableStatus::Skipped);
        assert_eq!(brvs(&store.rows("marked").await), vec!["M1"]);
        assert!(!store
            .operations()
            .await
            .iter()
            .any(|op| op.ends_with(":marked")));

        let clearing = TableSynchronizer::new(store.clone(), tables, observer).with_options(
            SyncOptions {
                clear_absent_sections: true,
            },
        );
        let report = clearing.sync_cycle(&cycle).await;
        assert_eq!(report.outcome("marked").unwrap().status, TableStatus::Done);
        assert!(store.rows("marked").await.is_empty());
        assert_eq!(brvs(&store.rows("marked_history").await), vec!["M1"]);
    }

    #[tokio::test]
    async fn empty_section_clears_live_rows() {
        let store = Arc::new(MemoryStore::new());
        store.seed("loaded", vec![live_row("L1")]).await;
        let sync = TableSynchronizer::new(
            store.clone(),
            registry(&[TableSpec::new("loaded")]),
            Arc::new(RecordingObserver::default()),
        );
        let report = sync.sync_cycle(&sections(&[("loaded", Vec::new())])).await;
        let outcome = report.outcome("loaded").unwrap();
        assert_eq!((outcome.archived, outcome.inserted), (1, 0));
        assert!(store.rows("loaded").await.is_empty());
    }

    #[tokio::test]
    async fn history_grows_once_per_backup_cycle() {
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let spec = TableSpec::new("depot_manager").trackable();
        let sync =
            TableSynchronizer::new(store.clone(), registry(&[spec.clone()]), observer.clone());
        let cycle = sections(&[("depot_manager", vec![record("AS1")])]);
        let hash = content_hash(&record("AS1"));
        let history_count = |rows: Vec<JsonValue>| {
            rows.iter()
                .filter(|r| r["record_hash"].as_str() == Some(hash.as_str()))
                .count()
        };

        sync.sync_cycle(&cycle).await;
        assert_eq!(history_count(store.rows("depot_manager_history").await), 0);

        sync.sync_cycle(&cycle).await;
        assert_eq!(history_count(store.rows("depot_manager_history").await), 1);

        sync.sync_cycle(&cycle).await;
        assert_eq!(history_count(store.rows("depot_manager_history").await), 2);

        // surfaced by the first two detection passes, archived from then on
        let new_counts: Vec<usize> = observer
            .new_records()
            .await
            .iter()
            .map(|(_, records)| records.len())
            .collect();
        assert_eq!(new_counts, vec![1, 1, 0]);
        assert!(store.rows("depot_manager_new_records").await.is_empty());
    }

    #[tokio::test]
    async fn staging_failure_still_reloads_live_table() {
        let store = Arc::new(MemoryStore::new());
        store.seed("depot_manager", vec![live_row("OLD")]).await;
        store.fail("depot_manager_new_records", StoreOp::Delete).await;
        let observer = Arc::new(RecordingObserver::default());
        let sync = TableSynchronizer::new(
            store.clone(),
            registry(&[TableSpec::new("depot_manager").trackable()]),
            observer.clone(),
        );

        let report = sync
            .sync_cycle(&sections(&[("depot_manager", vec![record("NEW")])]))
            .await;

        let outcome = report.outcome("depot_manager").unwrap();
        assert_eq!(outcome.status, TableStatus::Done);
        assert_eq!(outcome.state, SyncState::Done);
        assert!(outcome.staging_error.as_deref().unwrap().starts_with("stage"));
        assert_eq!((outcome.new_records, outcome.archived, outcome.inserted), (0, 1, 1));
        assert_eq!(brvs(&store.rows("depot_manager").await), vec!["NEW"]);
        assert_eq!(brvs(&store.rows("depot_manager_history").await), vec!["OLD"]);
        assert!(observer.new_records().await.is_empty());
        assert!(observer.critical_errors().await.is_empty());
    }

    #[tokio::test]
    async fn unreadable_history_skips_detection_only() {
        let store = Arc::new(MemoryStore::new());
        store.seed("depot_manager", vec![live_row("OLD")]).await;
        store.fail("depot_manager_history", StoreOp::Select).await;
        let observer = Arc::new(RecordingObserver::default());
        let sync = TableSynchronizer::new(
            store.clone(),
            registry(&[TableSpec::new("depot_manager").trackable()]),
            observer.clone(),
        );

        let report = sync
            .sync_cycle(&sections(&[("depot_manager", vec![record("NEW")])]))
            .await;

        let outcome = report.outcome("depot_manager").unwrap();
        assert_eq!(outcome.status, TableStatus::Done);
        assert!(outcome.staging_error.as_deref().unwrap().starts_with("detect"));
        assert_eq!(brvs(&store.rows("depot_manager").await), vec!["NEW"]);
        assert!(!store
            .operations()
            .await
            .iter()
            .any(|op| op.ends_with(":depot_manager_new_records")));
        assert!(observer.new_records().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_cycle_starts_no_steps_and_does_not_escalate() {
        let store = Arc::new(MemoryStore::new());
        store.seed("depot_manager", vec![live_row("OLD")]).await;
        let observer = Arc::new(RecordingObserver::default());
        let sync = TableSynchronizer::new(
            store.clone(),
            registry(&[TableSpec::new("depot_manager").trackable()]),
            observer.clone(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = sync
            .sync_cycle_until(
                Uuid::new_v4(),
                &sections(&[("depot_manager", vec![record("NEW")])]),
                &cancel,
            )
            .await;

        let outcome = report.outcome("depot_manager").unwrap();
        assert_eq!(outcome.status, TableStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("abandoned"));
        assert!(store.operations().await.is_empty());
        assert_eq!(brvs(&store.rows("depot_manager").await), vec!["OLD"]);
        assert!(observer.new_records().await.is_empty());
        assert!(observer.critical_errors().await.is_empty());
    }

    /// Wraps a memory store with canned connection-level failures.
    struct ScriptedStore {
        inner: MemoryStore,
        missing: Vec<&'static str>,
        exhausted: Vec<&'static str>,
    }

    impl ScriptedStore {
        fn new(missing: Vec<&'static str>, exhausted: Vec<&'static str>) -> Self {
            Self {
                inner: MemoryStore::new(),
                missing,
                exhausted,
            }
        }
    }

    #[async_trait::async_trait]
    impl TableStore for ScriptedStore {
        async fn select(
            &self,
            table: &str,
            params: &[(String, String)],
            use_cache: bool,
        ) -> Result<Vec<JsonValue>, StoreError> {
            self.inner.select(table, params, use_cache).await
        }

        async fn select_all(
            &self,
            table: &str,
            columns: &str,
        ) -> Result<Vec<JsonValue>, StoreError> {
            self.inner.select_all(table, columns).await
        }

        async fn insert_rows(&self, table: &str, rows: &[JsonValue]) -> dmon_storage::BatchOutcome {
            self.inner.insert_rows(table, rows).await
        }

        async fn delete_all(&self, table: &str) -> Result<(), StoreError> {
            if self.exhausted.iter().any(|t| *t == table) {
                return Err(StoreError::ConnectionExhausted {
                    attempts: 3,
                    last_error: "connection refused".into(),
                });
            }
            self.inner.delete_all(table).await
        }

        async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
            self.inner.count_rows(table).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn probe_tables(&self, tables: &[String]) -> Vec<Result<(), StoreError>> {
            tables
                .iter()
                .map(|t| {
                    if self.missing.iter().any(|m| *m == t.as_str()) {
                        Err(StoreError::HttpStatus {
                            method: "GET".into(),
                            status: 404,
                            url: format!("memory://{t}"),
                            body: r#"{"code":"42P01"}"#.into(),
                        })
                    } else {
                        Ok(())
                    }
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn exhausted_connections_escalate_even_when_other_tables_succeed() {
        let observer = Arc::new(RecordingObserver::default());
        let sync = TableSynchronizer::new(
            Arc::new(ScriptedStore::new(Vec::new(), vec!["marked"])),
            registry(&[TableSpec::new("loaded"), TableSpec::new("marked")]),
            observer.clone(),
        );

        let report = sync
            .sync_cycle(&sections(&[
                ("loaded", vec![record("L1")]),
                ("marked", vec![record("M1")]),
            ]))
            .await;

        assert_eq!(report.outcome("loaded").unwrap().status, TableStatus::Done);
        assert!(report.outcome("marked").unwrap().connection_exhausted);
        assert!(!report.all_failed());
        let errors = observer.critical_errors().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("exhausted"));
    }

    #[tokio::test]
    async fn verify_tables_reports_missing_relations() {
        let sync = TableSynchronizer::new(
            Arc::new(ScriptedStore::new(vec!["marked"], Vec::new())),
            registry(&[TableSpec::new("loaded"), TableSpec::new("marked")]),
            Arc::new(RecordingObserver::default()),
        );
        assert_eq!(sync.verify_tables().await, vec!["marked"]);
    }
}
