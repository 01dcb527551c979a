//! Daily order report decoding, cleaning and section parsing.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use dmon_core::{Record, Section};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "dmon-report";

/// The one date layout the export uses for `order_date`.
pub const DATE_FORMAT: &str = "%d-%m-%Y";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no report rows remain after the domain filter (needles: {needles:?})")]
    DomainFilterEmpty { needles: Vec<String> },
    #[error("export payload could not be decoded: {0}")]
    Decode(String),
    #[error("export payload contained no rows")]
    EmptyExport,
}

/// Cleaned cell matrix. `columns[i]` is the source position of the `i`-th kept column,
/// so positional field mapping survives empty-column removal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CellMatrix {
    pub columns: Vec<usize>,
    pub rows: Vec<Vec<String>>,
}

impl CellMatrix {
    /// Matrix whose columns are the source positions `0..width`.
    pub fn from_rows(rows: Vec<Vec<String>>) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, String::new());
                r
            })
            .collect();
        Self {
            columns: (0..width).collect(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn index_of(&self, source_position: usize) -> Option<usize> {
        self.columns.iter().position(|&c| c == source_position)
    }
}

fn non_empty_cells(row: &[String]) -> impl Iterator<Item = &String> {
    row.iter().filter(|c| !c.trim().is_empty())
}

/// Decodes the export body into raw rows. Accepts an HTML `<table>` rendering or a
/// JSON array of arrays.
pub fn decode_export(body: &[u8]) -> Result<Vec<Vec<String>>, ReportError> {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_start();
    let rows = if trimmed.starts_with('[') {
        decode_json_matrix(trimmed)?
    } else if trimmed.to_ascii_lowercase().contains("<tr") {
        decode_html_table(trimmed)?
    } else {
        return Err(ReportError::Decode(
            "unsupported export format, expected an HTML table or JSON rows".to_string(),
        ));
    };
    if rows.is_empty() {
        return Err(ReportError::EmptyExport);
    }
    Ok(rows)
}

fn decode_json_matrix(text: &str) -> Result<Vec<Vec<String>>, ReportError> {
    let rows: Vec<Vec<JsonValue>> =
        serde_json::from_str(text).map_err(|e| ReportError::Decode(e.to_string()))?;
    Ok(rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|cell| match cell {
                    JsonValue::String(s) => s,
                    JsonValue::Null => String::new(),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect())
}

fn decode_html_table(text: &str) -> Result<Vec<Vec<String>>, ReportError> {
    let document = Html::parse_document(text);
    let row_sel = Selector::parse("tr").map_err(|e| ReportError::Decode(e.to_string()))?;
    let cell_sel = Selector::parse("th, td").map_err(|e| ReportError::Decode(e.to_string()))?;

    let mut rows = Vec::new();
    for tr in document.select(&row_sel) {
        let mut cells = Vec::new();
        for cell in tr.select(&cell_sel) {
            let text = cell
                .text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            let span = cell
                .value()
                .attr("colspan")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(1)
                .max(1);
            cells.push(text);
            cells.extend(std::iter::repeat(String::new()).take(span - 1));
        }
        rows.push(cells);
    }
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningRules {
    /// Leading rows discarded before data, including the sheet's own header row.
    pub header_rows: usize,
    pub total_marker: String,
    /// Location substrings a data row must contain. Empty disables the filter.
    pub location_needles: Vec<String>,
}

impl Default for CleaningRules {
    fn default() -> Self {
        Self {
            header_rows: 8,
            total_marker: "Total #".to_string(),
            location_needles: vec!["BOST-KUMASI".to_string(), "BOST - KUMASI".to_string()],
        }
    }
}

fn normalize_cell(cell: String) -> String {
    let trimmed = cell.trim();
    if trimmed.eq_ignore_ascii_case("nan") {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// Strips header rows, blanks `nan` cells, drops empty rows and columns, then drops
/// subtotal rows.
pub fn clean(raw: Vec<Vec<String>>, rules: &CleaningRules) -> CellMatrix {
    let width = raw.iter().map(Vec::len).max().unwrap_or(0);
    let rows: Vec<Vec<String>> = raw
        .into_iter()
        .skip(rules.header_rows)
        .map(|row| {
            let mut cells: Vec<String> = row.into_iter().map(normalize_cell).collect();
            cells.resize(width, String::new());
            cells
        })
        .filter(|row| row.iter().any(|c| !c.is_empty()))
        .collect();

    let columns: Vec<usize> = (0..width)
        .filter(|&c| rows.iter().any(|r| !r[c].is_empty()))
        .collect();

    let rows = rows
        .into_iter()
        .map(|r| columns.iter().map(|&c| r[c].clone()).collect::<Vec<_>>())
        .filter(|r| !r.iter().any(|c| c.contains(&rules.total_marker)))
        .collect();

    CellMatrix { columns, rows }
}

/// Keeps rows mentioning one of `needles`, plus rows whose last column is empty
/// (section markers). Fails when no row mentions any needle.
pub fn apply_domain_filter(
    matrix: CellMatrix,
    needles: &[String],
) -> Result<CellMatrix, ReportError> {
    if needles.is_empty() {
        return Ok(matrix);
    }
    let matches = |row: &[String]| row.iter().any(|c| needles.iter().any(|n| c.contains(n)));

    if !matrix.rows.iter().any(|r| matches(r)) {
        return Err(ReportError::DomainFilterEmpty {
            needles: needles.to_vec(),
        });
    }

    let CellMatrix { columns, rows } = matrix;
    let rows = rows
        .into_iter()
        .filter(|r| matches(r) || r.last().map(|c| c.trim().is_empty()).unwrap_or(true))
        .collect();
    Ok(CellMatrix { columns, rows })
}

/// Source column positions of the canonical fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub order_date: usize,
    pub order_number: usize,
    pub products: usize,
    pub volume: usize,
    pub ex_ref_price: usize,
    pub brv_number: usize,
    pub bdc: usize,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            order_date: 0,
            order_number: 2,
            products: 5,
            volume: 9,
            ex_ref_price: 10,
            brv_number: 12,
            bdc: 15,
        }
    }
}

fn normalize_label(text: &str) -> String {
    text.to_uppercase()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct ReportParser {
    /// `(normalized label, table name)`, longest label first.
    labels: Vec<(String, String)>,
    columns: ColumnMap,
}

impl ReportParser {
    pub fn new<'a>(tables: impl IntoIterator<Item = &'a str>) -> Self {
        let mut labels: Vec<(String, String)> = tables
            .into_iter()
            .map(|t| (normalize_label(t), t.to_string()))
            .collect();
        labels.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self {
            labels,
            columns: ColumnMap::default(),
        }
    }

    pub fn with_columns(mut self, columns: ColumnMap) -> Self {
        self.columns = columns;
        self
    }

    /// Table named by a marker row: exactly one non-empty cell whose normalized text
    /// contains a known label. The longest matching label wins.
    pub fn marker_for(&self, row: &[String]) -> Option<&str> {
        let mut cells = non_empty_cells(row);
        let only = cells.next()?;
        if cells.next().is_some() {
            return None;
        }
        let text = normalize_label(only);
        self.labels
            .iter()
            .find(|(label, _)| text.contains(label.as_str()))
            .map(|(_, table)| table.as_str())
    }

    /// Row ranges between markers. Rows before the first marker belong to no section.
    pub fn find_sections(&self, matrix: &CellMatrix) -> Vec<Section> {
        let mut sections: Vec<Section> = Vec::new();
        let last_row = matrix.len().saturating_sub(1);

        for (idx, row) in matrix.rows.iter().enumerate() {
            if let Some(table) = self.marker_for(row) {
                if let Some(open) = sections.last_mut() {
                    open.end_row = idx - 1;
                }
                sections.push(Section {
                    name: table.to_string(),
                    start_row: idx + 1,
                    end_row: last_row,
                });
            }
        }
        sections
    }

    /// Records grouped by table. A repeated marker extends the same table's list.
    pub fn parse(&self, matrix: &CellMatrix) -> Result<BTreeMap<String, Vec<Record>>, ReportError> {
        if matrix.is_empty() {
            return Err(ReportError::DomainFilterEmpty {
                needles: Vec::new(),
            });
        }

        let positions = FieldPositions::resolve(matrix, &self.columns);
        let mut out: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for section in self.find_sections(matrix) {
            let records = out.entry(section.name.clone()).or_default();
            for row in &matrix.rows[section.rows()] {
                if non_empty_cells(row).take(2).count() < 2 {
                    continue;
                }
                let record = positions.record(row);
                if record.is_blank() {
                    debug!(section = %section.name, "skipping row with no canonical values");
                    continue;
                }
                records.push(record);
            }
        }
        Ok(out)
    }
}

/// Kept-column indices of each canonical field, `None` when the column was dropped.
struct FieldPositions {
    order_date: Option<usize>,
    order_number: Option<usize>,
    products: Option<usize>,
    volume: Option<usize>,
    ex_ref_price: Option<usize>,
    brv_number: Option<usize>,
    bdc: Option<usize>,
}

impl FieldPositions {
    fn resolve(matrix: &CellMatrix, map: &ColumnMap) -> Self {
        Self {
            order_date: matrix.index_of(map.order_date),
            order_number: matrix.index_of(map.order_number),
            products: matrix.index_of(map.products),
            volume: matrix.index_of(map.volume),
            ex_ref_price: matrix.index_of(map.ex_ref_price),
            brv_number: matrix.index_of(map.brv_number),
            bdc: matrix.index_of(map.bdc),
        }
    }

    fn record(&self, row: &[String]) -> Record {
        let cell = |idx: Option<usize>| idx.and_then(|i| row.get(i)).map(String::as_str);
        Record {
            order_date: cell(self.order_date).and_then(parse_date),
            order_number: cell(self.order_number).and_then(parse_text),
            products: cell(self.products).and_then(parse_text),
            volume: cell(self.volume).and_then(parse_volume),
            ex_ref_price: cell(self.ex_ref_price).and_then(parse_price),
            brv_number: cell(self.brv_number).and_then(parse_text),
            bdc: cell(self.bdc).and_then(parse_text),
        }
    }
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

pub fn parse_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Integral volumes; spreadsheet renderings like `54000.0` are accepted.
pub fn parse_volume(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Some(v);
    }
    let v = trimmed.parse::<f64>().ok()?;
    (v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64).then_some(v as i64)
}

pub fn parse_price(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// decode -> clean -> domain filter -> section parse.
pub fn parse_export(
    body: &[u8],
    rules: &CleaningRules,
    parser: &ReportParser,
) -> Result<BTreeMap<String, Vec<Record>>, ReportError> {
    let raw = decode_export(body)?;
    let matrix = clean(raw, rules);
    let matrix = apply_domain_filter(matrix, &rules.location_needles)?;
    debug!(rows = matrix.len(), columns = matrix.columns.len(), "cleaned export");
    parser.parse(&matrix)
}
