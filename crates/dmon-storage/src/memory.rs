use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{BatchOutcome, StoreError, TableStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Select,
    Insert,
    Delete,
    Count,
}

/// In-process [`TableStore`] for tests. Records every operation so
/// callers can assert on ordering, and can be told to fail specific table operations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, Vec<JsonValue>>>,
    failures: Mutex<HashSet<(String, StoreOp)>>,
    log: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, table: &str, rows: Vec<JsonValue>) {
        let rows = rows.into_iter().map(|r| self.with_id(r)).collect::<Vec<_>>();
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub async fn rows(&self, table: &str) -> Vec<JsonValue> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn fail(&self, table: &str, op: StoreOp) {
        self.failures.lock().await.insert((table.to_string(), op));
    }

    pub async fn heal(&self, table: &str, op: StoreOp) {
        self.failures.lock().await.remove(&(table.to_string(), op));
    }

    /// Operations in call order, formatted as `op:table`.
    pub async fn operations(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    async fn check(&self, table: &str, op: StoreOp) -> Result<(), StoreError> {
        self.log
            .lock()
            .await
            .push(format!("{}:{table}", op_name(op)));
        if self.failures.lock().await.contains(&(table.to_string(), op)) {
            return Err(StoreError::HttpStatus {
                method: op_name(op).to_uppercase(),
                status: 500,
                url: format!("memory://{table}"),
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn with_id(&self, mut row: JsonValue) -> JsonValue {
        if let Some(obj) = row.as_object_mut() {
            if !obj.contains_key("id") {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                obj.insert("id".to_string(), JsonValue::from(id));
            }
        }
        row
    }
}

fn op_name(op: StoreOp) -> &'static str {
    match op {
        StoreOp::Select => "select",
        StoreOp::Insert => "insert",
        StoreOp::Delete => "delete",
        StoreOp::Count => "count",
    }
}

fn field_as_text(row: &JsonValue, column: &str) -> Option<String> {
    field_text(row.get(column))
}

/// Applies the subset of PostgREST parameters the engine issues: `col=eq.value`,
/// `order=col.asc|desc`, `limit`, `offset`. `select` is ignored.
fn apply_params(mut rows: Vec<JsonValue>, params: &[(String, String)]) -> Vec<JsonValue> {
    let mut limit = None;
    let mut offset = 0usize;
    for (key, value) in params {
        match key.as_str() {
            "select" | "columns" => {}
            "limit" => limit = value.parse::<usize>().ok(),
            "offset" => offset = value.parse::<usize>().unwrap_or(0),
            "order" => {
                let (column, direction) = value.split_once('.').unwrap_or((value.as_str(), "asc"));
                rows.sort_by(|a, b| {
                    let (a, b) = (a.get(column), b.get(column));
                    let numeric = (a.and_then(JsonValue::as_f64), b.and_then(JsonValue::as_f64));
                    let ord = match numeric {
                        (Some(x), Some(y)) => {
                            x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
                        }
                        _ => field_text(a).cmp(&field_text(b)),
                    };
                    if direction == "desc" {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
            column => {
                if let Some(expected) = value.strip_prefix("eq.") {
                    rows.retain(|r| field_as_text(r, column).as_deref() == Some(expected));
                }
            }
        }
    }
    rows.into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

fn field_text(value: Option<&JsonValue>) -> Option<String> {
    value.and_then(|v| match v {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    })
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn select(
        &self,
        table: &str,
        params: &[(String, String)],
        _use_cache: bool,
    ) -> Result<Vec<JsonValue>, StoreError> {
        self.check(table, StoreOp::Select).await?;
        Ok(apply_params(self.rows(table).await, params))
    }

    async fn select_all(&self, table: &str, _columns: &str) -> Result<Vec<JsonValue>, StoreError> {
        self.check(table, StoreOp::Select).await?;
        Ok(self.rows(table).await)
    }

    async fn insert_rows(&self, table: &str, rows: &[JsonValue]) -> BatchOutcome {
        if rows.is_empty() {
            return BatchOutcome::default();
        }
        if let Err(err) = self.check(table, StoreOp::Insert).await {
            return BatchOutcome {
                inserted: 0,
                error: Some(err),
            };
        }
        let stored = rows.iter().cloned().map(|r| self.with_id(r)).collect::<Vec<_>>();
        let inserted = stored.len();
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(stored);
        BatchOutcome {
            inserted,
            error: None,
        }
    }

    async fn delete_all(&self, table: &str) -> Result<(), StoreError> {
        self.check(table, StoreOp::Delete).await?;
        self.tables.lock().await.remove(table);
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        self.check(table, StoreOp::Count).await?;
        Ok(self.rows(table).await.len() as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn probe_tables(&self, tables: &[String]) -> Vec<Result<(), StoreError>> {
        let mut out = Vec::with_capacity(tables.len());
        for table in tables {
            out.push(self.check(table, StoreOp::Select).await);
        }
        out
    }
}
