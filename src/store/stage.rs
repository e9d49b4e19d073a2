//! Append-only stage artifacts.
//!
//! Each stage is one CSV file: a `timestamp` column followed by one column per
//! key, empty cells for missing samples. A stage is written exactly once.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::StoreError;
use crate::domain::{ColumnKey, DomainError, Series, TimeSeriesTable};

const INDEX_HEADER: &str = "timestamp";

/// Directory of named stage artifacts
#[derive(Debug, Clone)]
pub struct StageStore {
    root: PathBuf,
}

impl StageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.csv", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Read a stage. Columns with unknown fields (e.g. forecasts) are skipped.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn load(&self, name: &str) -> Result<TimeSeriesTable, StoreError> {
        let path = self.path(name);
        if !path.exists() {
            return Err(StoreError::StageNotFound(name.to_string()));
        }
        let csv_err = |source: csv::Error| StoreError::Csv {
            path: path.clone(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)
            .map_err(csv_err)?;

        let headers = reader.headers().map_err(csv_err)?.clone();
        let mut keys: Vec<Option<ColumnKey>> = Vec::with_capacity(headers.len());
        for name in headers.iter().skip(1) {
            match name.parse::<ColumnKey>() {
                Ok(key) => keys.push(Some(key)),
                Err(DomainError::UnknownField { column, field }) => {
                    warn!(%column, %field, "skipping column with unknown field");
                    keys.push(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut index = Vec::new();
        let mut values: Vec<Series> = vec![Vec::new(); keys.len()];
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(csv_err)?;
            let raw_ts = record.get(0).unwrap_or_default();
            index.push(parse_timestamp(raw_ts).ok_or_else(|| StoreError::InvalidTimestamp {
                row,
                value: raw_ts.to_string(),
            })?);
            for (col, key) in keys.iter().enumerate() {
                let Some(key) = key else { continue };
                let cell = record.get(col + 1).unwrap_or_default();
                let value = parse_value(cell).ok_or_else(|| StoreError::InvalidValue {
                    row,
                    column: key.to_string(),
                    value: cell.to_string(),
                })?;
                values[col].push(value);
            }
        }

        let mut table = TimeSeriesTable::new(index)?;
        for (key, series) in keys.into_iter().zip(values) {
            if let Some(key) = key {
                if table.contains(&key) {
                    return Err(DomainError::DuplicateColumn(key.to_string()).into());
                }
                table.insert(key, series)?;
            }
        }
        info!(rows = table.len(), columns = table.column_count(), "stage loaded");
        Ok(table)
    }

    /// Persist a new stage. Existing stages are never overwritten.
    #[tracing::instrument(level = "info", skip(self, table), fields(rows = table.len()))]
    pub fn save(&self, name: &str, table: &TimeSeriesTable) -> Result<PathBuf, StoreError> {
        let path = self.path(name);
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AlreadyExists => StoreError::StageExists(name.to_string()),
                _ => StoreError::Io {
                    path: path.clone(),
                    source,
                },
            })?;
        let csv_err = |source: csv::Error| StoreError::Csv {
            path: path.clone(),
            source,
        };

        let mut writer = csv::Writer::from_writer(file);
        let columns: Vec<(&ColumnKey, &Series)> = table.columns().collect();
        let mut header = vec![INDEX_HEADER.to_string()];
        header.extend(columns.iter().map(|(k, _)| k.to_string()));
        writer.write_record(&header).map_err(csv_err)?;

        for (row, ts) in table.index().iter().enumerate() {
            let mut record = Vec::with_capacity(columns.len() + 1);
            record.push(ts.to_rfc3339_opts(SecondsFormat::Secs, true));
            record.extend(
                columns
                    .iter()
                    .map(|(_, v)| v[row].map(|x| x.to_string()).unwrap_or_default()),
            );
            writer.write_record(&record).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "stage written");
        Ok(path)
    }

    /// Write a JSON report next to the stages (reports may be replaced)
    pub fn write_report<T: Serialize>(&self, name: &str, report: &T) -> Result<PathBuf, StoreError> {
        let path = self.root.join(format!("{}.json", name));
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.root).map_err(io_err)?;
        let body = serde_json::to_vec_pretty(report).map_err(StoreError::Report)?;
        fs::write(&path, body).map_err(io_err)?;
        Ok(path)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// `Some(None)` for an empty or NaN cell, `None` if the cell is not a number
fn parse_value(raw: &str) -> Option<Option<f64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(None);
    }
    let value: f64 = raw.parse().ok()?;
    Some(value.is_finite().then_some(value))
}
