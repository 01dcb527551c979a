use std::collections::HashSet;
use std::sync::Arc;

use dmon_core::{Record, TableSpec};
use dmon_storage::{StoreError, TableStore};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::debug;

const FIELD_SEPARATOR: char = '\u{1f}';

/// SHA-256 over the canonical field values in fixed order, hex encoded.
pub fn content_hash(record: &Record) -> String {
    let joined = record.canonical_values().join(&FIELD_SEPARATOR.to_string());
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash carried by a stored row, recomputed from its fields when absent.
pub fn row_hash(row: &JsonValue) -> Result<String, StoreError> {
    if let Some(hash) = row.get("record_hash").and_then(JsonValue::as_str) {
        if !hash.is_empty() {
            return Ok(hash.to_string());
        }
    }
    Ok(content_hash(&decode_record(row)?))
}

pub fn decode_record(row: &JsonValue) -> Result<Record, StoreError> {
    serde_json::from_value(row.clone()).map_err(|e| StoreError::Decode {
        endpoint: "record".to_string(),
        message: e.to_string(),
    })
}

/// Novelty is judged against a table's history only, never its live rows.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn TableStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    pub async fn history_hashes(&self, spec: &TableSpec) -> Result<HashSet<String>, StoreError> {
        let rows = self.store.select_all(&spec.history_table(), "*").await?;
        rows.iter().map(row_hash).collect()
    }

    /// Candidates whose hash has never been archived, in input order. Reads only.
    pub async fn identify_new(
        &self,
        spec: &TableSpec,
        candidates: &[Record],
    ) -> Result<Vec<Record>, StoreError> {
        let seen = self.history_hashes(spec).await?;
        let fresh: Vec<Record> = candidates
            .iter()
            .filter(|r| !seen.contains(&content_hash(r)))
            .cloned()
            .collect();
        debug!(
            table = %spec.name,
            history = seen.len(),
            candidates = candidates.len(),
            new = fresh.len(),
            "identified new records"
        );
        Ok(fresh)
    }
}
