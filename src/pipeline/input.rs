//! Portable supplier rows and the tabular loaders.
//!
//! Rows cross the worker boundary, so every value is reduced to a JSON-safe
//! scalar at load time: dates become ISO-8601 strings, non-finite floats and
//! blank cells become explicit nulls. Identifier and postal columns are
//! forced to strings so leading zeros survive.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use super::{PipelineError, Result};

/// Columns whose values must stay strings even when a cell is numeric.
pub const STRING_FIELDS: [&str; 9] = [
    "Auxiliaire",
    "Code tiers",
    "Postal",
    "Code SIRET",
    "Code NIF",
    "Code NAF",
    "Code SIREN",
    "SIRET",
    "SIREN",
];

/// Days between 0001-01-01 and the unix epoch, for parquet date columns.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// A single JSON-safe cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() {
            Scalar::Number(value)
        } else {
            Scalar::Null
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// String form of the value; empty for nulls, integer-like numbers
    /// rendered without a trailing fraction.
    pub fn render(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => render_number(*n),
            Scalar::Text(s) => s.clone(),
        }
    }
}

fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// One supplier record as an open field → scalar mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SupplierRow {
    fields: BTreeMap<String, Scalar>,
}

impl SupplierRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Scalar) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.fields.get(key)
    }

    /// The cell as a scalar, null when the field is absent.
    pub fn scalar(&self, key: &str) -> Scalar {
        self.fields.get(key).cloned().unwrap_or(Scalar::Null)
    }

    /// The cell rendered as text, empty when absent or null.
    pub fn text(&self, key: &str) -> String {
        self.fields.get(key).map(Scalar::render).unwrap_or_default()
    }

    /// First key whose rendered value is non-blank.
    pub fn first_text(&self, keys: &[&str]) -> String {
        for key in keys {
            let value = self.text(key);
            if !value.trim().is_empty() {
                return value;
            }
        }
        String::new()
    }

    /// Stable identifier of the row: external id, alternate id, or the
    /// zero-based row index recorded at load time.
    pub fn input_id(&self) -> String {
        self.first_text(&["Auxiliaire", "Code tiers", "index"])
    }

    pub fn set_index(&mut self, index: usize) {
        self.insert("index", Scalar::Text(index.to_string()));
    }
}

/// A loaded input table: header order plus one row per record.
#[derive(Debug, Clone, Default)]
pub struct SupplierTable {
    pub headers: Vec<String>,
    pub rows: Vec<SupplierRow>,
}

/// Load a supplier table from Excel, CSV or Parquet, detected by extension.
pub fn load_supplier_table(path: &Path, limit_rows: Option<usize>) -> Result<SupplierTable> {
    if !path.exists() {
        return Err(PipelineError::InvalidInput(format!(
            "input file not found: {}",
            path.display()
        )));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let table = match ext.as_str() {
        "xlsx" | "xls" | "xlsm" | "xlsb" => load_excel(path, limit_rows)?,
        "csv" => load_csv(path, limit_rows)?,
        "parquet" => load_parquet(path, limit_rows)?,
        other => {
            return Err(PipelineError::InvalidInput(format!(
                "unsupported input format '.{other}' for {}",
                path.display()
            )))
        }
    };
    tracing::info!("loaded {} rows from {}", table.rows.len(), path.display());
    Ok(table)
}

fn force_string(header: &str) -> bool {
    STRING_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(header))
}

fn load_excel(path: &Path, limit_rows: Option<usize>) -> Result<SupplierTable> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| PipelineError::InvalidInput(format!("cannot open {}: {e}", path.display())))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| PipelineError::InvalidInput(format!("{} has no sheet", path.display())))?
        .map_err(|e| PipelineError::InvalidInput(format!("cannot read {}: {e}", path.display())))?;

    let mut rows_iter = range.rows();
    let headers: Vec<String> = rows_iter
        .next()
        .map(|cells| cells.iter().map(header_text).collect())
        .unwrap_or_default();

    let mut rows = Vec::new();
    for (index, cells) in rows_iter.enumerate() {
        if limit_rows.is_some_and(|n| rows.len() >= n) {
            break;
        }
        let mut row = SupplierRow::new();
        for (col, cell) in cells.iter().enumerate() {
            let Some(header) = headers.get(col) else {
                continue;
            };
            if header.is_empty() {
                continue;
            }
            row.insert(header.clone(), scalar_from_cell(force_string(header), cell));
        }
        row.set_index(index);
        rows.push(row);
    }
    Ok(SupplierTable { headers, rows })
}

fn header_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

fn scalar_from_cell(forced: bool, cell: &Data) -> Scalar {
    match cell {
        Data::Empty | Data::Error(_) => Scalar::Null,
        Data::String(s) => text_scalar(s),
        Data::Bool(b) => Scalar::Bool(*b),
        Data::Int(i) => {
            if forced {
                Scalar::Text(i.to_string())
            } else {
                Scalar::Number(*i as f64)
            }
        }
        Data::Float(f) => {
            if !f.is_finite() {
                Scalar::Null
            } else if forced {
                Scalar::Text(render_number(*f))
            } else {
                Scalar::Number(*f)
            }
        }
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) => Scalar::Text(naive.format("%Y-%m-%dT%H:%M:%S").to_string()),
            None => Scalar::Null,
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => text_scalar(s),
    }
}

fn text_scalar(s: &str) -> Scalar {
    let trimmed = s.trim();
    if trimmed.is_empty() || matches!(trimmed, "NaN" | "nan" | "NULL" | "null" | "None") {
        Scalar::Null
    } else {
        Scalar::Text(s.to_string())
    }
}

fn load_csv(path: &Path, limit_rows: Option<usize>) -> Result<SupplierTable> {
    let bytes = fs::read(path)?;
    // UTF-8 first, latin-1 as the legacy fallback.
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!("{} is not UTF-8, decoding as latin-1", path.display());
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        if limit_rows.is_some_and(|n| rows.len() >= n) {
            break;
        }
        let record = record?;
        let mut row = SupplierRow::new();
        for (col, value) in record.iter().enumerate() {
            let Some(header) = headers.get(col) else {
                continue;
            };
            if header.is_empty() {
                continue;
            }
            row.insert(header.clone(), text_scalar(value));
        }
        row.set_index(index);
        rows.push(row);
    }
    Ok(SupplierTable { headers, rows })
}

fn load_parquet(path: &Path, limit_rows: Option<usize>) -> Result<SupplierTable> {
    let mut lf = LazyFrame::scan_parquet(
        PlPath::new(&path.to_string_lossy()),
        ScanArgsParquet::default(),
    )?;
    if let Some(n) = limit_rows {
        lf = lf.limit(n as IdxSize);
    }
    let df = lf.collect()?;
    let headers: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|n| n.to_string())
        .collect();

    let mut rows = Vec::with_capacity(df.height());
    for index in 0..df.height() {
        let mut row = SupplierRow::new();
        for column in df.get_columns() {
            let header = column.name().to_string();
            let value = column.as_materialized_series().get(index)?;
            row.insert(header.clone(), scalar_from_any(force_string(&header), &value));
        }
        row.set_index(index);
        rows.push(row);
    }
    Ok(SupplierTable { headers, rows })
}

fn scalar_from_any(forced: bool, value: &AnyValue) -> Scalar {
    let number = |forced: bool, n: f64| {
        if !n.is_finite() {
            Scalar::Null
        } else if forced {
            Scalar::Text(render_number(n))
        } else {
            Scalar::Number(n)
        }
    };
    match value {
        AnyValue::Null => Scalar::Null,
        AnyValue::Boolean(b) => Scalar::Bool(*b),
        AnyValue::String(s) => text_scalar(s),
        AnyValue::StringOwned(s) => text_scalar(s.as_str()),
        AnyValue::Int8(v) => number(forced, *v as f64),
        AnyValue::Int16(v) => number(forced, *v as f64),
        AnyValue::Int32(v) => number(forced, *v as f64),
        AnyValue::Int64(v) => number(forced, *v as f64),
        AnyValue::UInt8(v) => number(forced, *v as f64),
        AnyValue::UInt16(v) => number(forced, *v as f64),
        AnyValue::UInt32(v) => number(forced, *v as f64),
        AnyValue::UInt64(v) => number(forced, *v as f64),
        AnyValue::Float32(v) => number(forced, *v as f64),
        AnyValue::Float64(v) => number(forced, *v),
        AnyValue::Date(days) => {
            match chrono::NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE) {
                Some(date) => Scalar::Text(date.format("%Y-%m-%d").to_string()),
                None => Scalar::Null,
            }
        }
        AnyValue::Datetime(raw, unit, _) => {
            let utc = match unit {
                TimeUnit::Milliseconds => chrono::DateTime::from_timestamp_millis(*raw),
                TimeUnit::Microseconds => chrono::DateTime::from_timestamp_micros(*raw),
                TimeUnit::Nanoseconds => chrono::DateTime::from_timestamp(
                    raw.div_euclid(1_000_000_000),
                    raw.rem_euclid(1_000_000_000) as u32,
                ),
            };
            match utc {
                Some(dt) => Scalar::Text(dt.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string()),
                None => Scalar::Null,
            }
        }
        other => text_scalar(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_number() {
        assert_eq!(render_number(75001.0), "75001");
        assert_eq!(render_number(1.5), "1.5");
    }

    #[test]
    fn test_input_id_fallbacks() {
        let mut row = SupplierRow::new();
        row.set_index(7);
        assert_eq!(row.input_id(), "7");

        row.insert("Code tiers", Scalar::Text("T42".into()));
        assert_eq!(row.input_id(), "T42");

        row.insert("Auxiliaire", Scalar::Text("A1".into()));
        assert_eq!(row.input_id(), "A1");

        // Blank external ids fall through.
        row.insert("Auxiliaire", Scalar::Text("  ".into()));
        assert_eq!(row.input_id(), "T42");
    }

    #[test]
    fn test_text_scalar_na_values() {
        assert_eq!(text_scalar(""), Scalar::Null);
        assert_eq!(text_scalar(" "), Scalar::Null);
        assert_eq!(text_scalar("NaN"), Scalar::Null);
        assert_eq!(text_scalar("null"), Scalar::Null);
        assert_eq!(text_scalar("PARIS"), Scalar::Text("PARIS".into()));
    }

    #[test]
    fn test_forced_string_keeps_leading_zeros() {
        // An Excel numeric cell for a postal code must come back as text.
        let scalar = scalar_from_cell(true, &Data::Float(6000.0));
        assert_eq!(scalar, Scalar::Text("6000".into()));
        let scalar = scalar_from_cell(false, &Data::Float(6000.0));
        assert_eq!(scalar, Scalar::Number(6000.0));
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert_eq!(scalar_from_cell(false, &Data::Float(f64::INFINITY)), Scalar::Null);
        assert_eq!(Scalar::from_f64(f64::NAN), Scalar::Null);
    }
}
