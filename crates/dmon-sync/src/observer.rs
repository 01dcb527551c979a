use std::sync::Arc;

use async_trait::async_trait;
use dmon_core::{ChangeEvent, Record};
use dmon_realtime::ChangeSubscriber;
use tracing::{error, info, warn};

/// Collaborator notified of new data and of conditions needing operator attention.
#[async_trait]
pub trait SyncObserver: Send + Sync {
    async fn on_new_records(&self, table: &str, records: &[Record]);

    async fn on_critical_error(&self, message: &str);
}

#[derive(Debug, Default)]
pub struct LoggingObserver;

#[async_trait]
impl SyncObserver for LoggingObserver {
    async fn on_new_records(&self, table: &str, records: &[Record]) {
        info!(table, new = records.len(), "new records detected");
    }

    async fn on_critical_error(&self, message: &str) {
        error!(message, "critical monitor error");
    }
}

/// Turns coalesced realtime batches into records for a [`SyncObserver`].
pub struct RecordForwarder {
    observer: Arc<dyn SyncObserver>,
}

impl RecordForwarder {
    pub fn new(observer: Arc<dyn SyncObserver>) -> Self {
        Self { observer }
    }
}

#[async_trait]
impl ChangeSubscriber for RecordForwarder {
    async fn on_changes(&self, table: &str, events: Vec<ChangeEvent>) {
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            match serde_json::from_value::<Record>(event.record) {
                Ok(record) => records.push(record),
                Err(err) => warn!(table, error = %err, "dropping undecodable realtime record"),
            }
        }
        if !records.is_empty() {
            self.observer.on_new_records(table, &records).await;
        }
    }
}
