use std::sync::Arc;

use dmon_core::TableRegistry;
use dmon_storage::{StoreError, TableStore};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_RECENT_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub table: String,
    pub record: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStat {
    pub table: String,
    pub rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read-only lookups over the live status tables. Reads go through the response cache.
#[derive(Clone)]
pub struct RecordQueries {
    store: Arc<dyn TableStore>,
    registry: TableRegistry,
}

impl RecordQueries {
    pub fn new(store: Arc<dyn TableStore>, registry: TableRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Rows whose `brv_number` matches exactly, across every registered table.
    /// Tables that fail are logged and skipped unless all of them fail.
    pub async fn search_by_brv(&self, brv: &str) -> Result<Vec<SearchHit>, QueryError> {
        let brv = brv.trim();
        let params = vec![("brv_number".to_string(), format!("eq.{brv}"))];
        let names = self.registry.names();
        let results = join_all(
            names
                .iter()
                .map(|table| self.store.select(table, &params, true)),
        )
        .await;

        let mut hits = Vec::new();
        let mut first_error = None;
        let mut failures = 0usize;
        for (table, result) in names.iter().zip(results) {
            match result {
                Ok(rows) => hits.extend(rows.into_iter().map(|record| SearchHit {
                    table: table.to_string(),
                    record,
                })),
                Err(err) => {
                    warn!(table, error = %err, "search failed for table");
                    failures += 1;
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) if failures == names.len() => Err(err.into()),
            _ => Ok(hits),
        }
    }

    /// Newest rows of `table` by `created_at`.
    pub async fn recent(
        &self,
        table: &str,
        limit: Option<usize>,
    ) -> Result<Vec<JsonValue>, QueryError> {
        if self.registry.get(table).is_none() {
            return Err(QueryError::UnknownTable(table.to_string()));
        }
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT).max(1);
        let params = vec![
            ("order".to_string(), "created_at.desc".to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        Ok(self.store.select(table, &params, true).await?)
    }

    pub async fn table_stats(&self) -> Vec<TableStat> {
        let names = self.registry.names();
        let counts = join_all(names.iter().map(|table| self.store.count_rows(table))).await;
        names
            .into_iter()
            .zip(counts)
            .map(|(table, count)| match count {
                Ok(rows) => TableStat {
                    table: table.to_string(),
                    rows: Some(rows),
                    error: None,
                },
                Err(err) => TableStat {
                    table: table.to_string(),
                    rows: None,
                    error: Some(err.to_string()),
                },
            })
            .collect()
    }
}
