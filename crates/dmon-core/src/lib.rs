//! Core domain model for the depot order monitor: records, sections, table registry.

use std::ops::Range;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "dmon-core";

/// Canonical column names in hashing order.
pub const CANONICAL_FIELDS: [&str; 7] = [
    "order_date",
    "order_number",
    "products",
    "volume",
    "ex_ref_price",
    "brv_number",
    "bdc",
];

/// Status tables known to the upstream daily order report.
pub const DEFAULT_TABLES: [&str; 12] = [
    "approved",
    "bdc_cancel_order",
    "bdc_decline",
    "brv_checked",
    "depot_manager",
    "good_standing",
    "loaded",
    "order_released",
    "ordered",
    "ppmc_cancel_order",
    "depot_manager_decline",
    "marked",
];

/// One order line of the report, reduced to the canonical 7 fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, deserialize_with = "deserialize_order_date")]
    pub order_date: Option<NaiveDate>,
    #[serde(default)]
    pub order_number: Option<String>,
    #[serde(default)]
    pub products: Option<String>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub ex_ref_price: Option<f64>,
    #[serde(default)]
    pub brv_number: Option<String>,
    #[serde(default)]
    pub bdc: Option<String>,
}

impl Record {
    /// Field values rendered as strings in [`CANONICAL_FIELDS`] order, empty for null.
    pub fn canonical_values(&self) -> [String; 7] {
        [
            self.order_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            self.order_number.clone().unwrap_or_default(),
            self.products.clone().unwrap_or_default(),
            self.volume.map(|v| v.to_string()).unwrap_or_default(),
            self.ex_ref_price.map(|p| p.to_string()).unwrap_or_default(),
            self.brv_number.clone().unwrap_or_default(),
            self.bdc.clone().unwrap_or_default(),
        ]
    }

    pub fn is_blank(&self) -> bool {
        self.canonical_values().iter().all(|v| v.is_empty())
    }
}

/// Stored dates come back either as `YYYY-MM-DD` or as a timestamp whose first ten
/// characters are the date.
fn deserialize_order_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        let day = s.get(..10).unwrap_or(&s);
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }))
}

/// Row shape written to a live status table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveRow {
    #[serde(flatten)]
    pub record: Record,
    pub record_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Archived copy of a previously-live row. Append-only per table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub record: Record,
    #[serde(default)]
    pub record_hash: Option<String>,
    pub archived_at: DateTime<Utc>,
}

/// A record flagged as new by the latest detection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedNewRecord {
    #[serde(flatten)]
    pub record: Record,
    pub record_hash: String,
    pub detected_at: DateTime<Utc>,
}

/// Insert event pushed by the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub record: JsonValue,
}

/// Contiguous row range belonging to one status table. Empty when `start_row > end_row`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub start_row: usize,
    pub end_row: usize,
}

impl Section {
    pub fn is_empty(&self) -> bool {
        self.start_row > self.end_row
    }

    pub fn rows(&self) -> Range<usize> {
        if self.is_empty() {
            self.start_row..self.start_row
        } else {
            self.start_row..self.end_row + 1
        }
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    /// Trackable tables run change detection and stage their new records.
    #[serde(default)]
    pub trackable: bool,
    #[serde(default)]
    pub staging_table: Option<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trackable: false,
            staging_table: None,
        }
    }

    pub fn trackable(mut self) -> Self {
        self.trackable = true;
        self
    }

    pub fn history_table(&self) -> String {
        format!("{}_history", self.name)
    }

    pub fn staging_table(&self) -> String {
        self.staging_table
            .clone()
            .unwrap_or_else(|| format!("{}_new_records", self.name))
    }

    /// Label as it appears on a section marker row, e.g. `DEPOT MANAGER`.
    pub fn section_label(&self) -> String {
        self.name.to_uppercase().replace('_', " ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegistry {
    pub tables: Vec<TableSpec>,
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self {
            tables: DEFAULT_TABLES
                .iter()
                .map(|name| {
                    let spec = TableSpec::new(*name);
                    if *name == "depot_manager" {
                        spec.trackable()
                    } else {
                        spec
                    }
                })
                .collect(),
        }
    }
}

impl TableRegistry {
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn trackable(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter().filter(|t| t.trackable)
    }
}
