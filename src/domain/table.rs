use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::BTreeMap;
use std::ops::Range;

use super::column::ColumnKey;
use super::types::DomainError;
use super::window::TimeWindow;

/// One sample per timestamp; `None` marks a missing value
pub type Series = Vec<Option<f64>>;

/// Hourly, UTC-indexed numeric table.
///
/// The index is strictly increasing and every timestamp sits on the hour.
/// Consecutive timestamps are usually one hour apart, but aggregated tables
/// (monthly, yearly) keep the same type with a sparser index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeSeriesTable {
    index: Vec<DateTime<Utc>>,
    columns: BTreeMap<ColumnKey, Series>,
}

impl TimeSeriesTable {
    /// Create an empty table over `index`
    pub fn new(index: Vec<DateTime<Utc>>) -> Result<Self, DomainError> {
        for (pos, ts) in index.iter().enumerate() {
            if ts.minute() != 0 || ts.second() != 0 || ts.nanosecond() != 0 {
                return Err(DomainError::UnalignedTimestamp(ts.to_rfc3339()));
            }
            if pos > 0 && index[pos - 1] >= *ts {
                return Err(DomainError::NonMonotonicIndex(pos));
            }
        }
        Ok(Self {
            index,
            columns: BTreeMap::new(),
        })
    }

    /// Contiguous hourly index of `hours` rows starting at `start`
    pub fn hourly(start: DateTime<Utc>, hours: usize) -> Result<Self, DomainError> {
        let index = (0..hours as i64).map(|h| start + Duration::hours(h)).collect();
        Self::new(index)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[DateTime<Utc>] {
        &self.index
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Row position of `ts`, if present
    pub fn position(&self, ts: DateTime<Utc>) -> Option<usize> {
        self.index.binary_search(&ts).ok()
    }

    /// Row positions covered by `window`
    pub fn window_range(&self, window: &TimeWindow) -> Range<usize> {
        let lo = match window.start {
            Some(start) => self.index.partition_point(|ts| *ts < start),
            None => 0,
        };
        let hi = match window.end {
            Some(end) => self.index.partition_point(|ts| *ts < end),
            None => self.index.len(),
        };
        lo..hi.max(lo)
    }

    pub fn contains(&self, key: &ColumnKey) -> bool {
        self.columns.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ColumnKey> {
        self.columns.keys()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&ColumnKey, &Series)> {
        self.columns.iter()
    }

    pub fn column(&self, key: &ColumnKey) -> Option<&[Option<f64>]> {
        self.columns.get(key).map(Vec::as_slice)
    }

    pub fn column_mut(&mut self, key: &ColumnKey) -> Option<&mut [Option<f64>]> {
        self.columns.get_mut(key).map(Vec::as_mut_slice)
    }

    /// Sample at row `pos`, `None` if the column is absent or the sample missing
    pub fn value(&self, key: &ColumnKey, pos: usize) -> Option<f64> {
        self.columns.get(key).and_then(|c| c.get(pos).copied().flatten())
    }

    /// Insert or replace a column, returning the previous values
    pub fn insert(&mut self, key: ColumnKey, values: Series) -> Result<Option<Series>, DomainError> {
        if values.len() != self.index.len() {
            return Err(DomainError::LengthMismatch {
                column: key.to_string(),
                expected: self.index.len(),
                actual: values.len(),
            });
        }
        Ok(self.columns.insert(key, values))
    }

    pub fn remove(&mut self, key: &ColumnKey) -> Option<Series> {
        self.columns.remove(key)
    }

    /// Copy of the table restricted to the columns matching `keep`
    pub fn select(&self, keep: impl Fn(&ColumnKey) -> bool) -> Self {
        Self {
            index: self.index.clone(),
            columns: self
                .columns
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Rows present in both tables, columns of both. Keys may not overlap.
    pub fn inner_join(&self, other: &Self) -> Result<Self, DomainError> {
        if let Some(dup) = other.columns.keys().find(|k| self.columns.contains_key(k)) {
            return Err(DomainError::DuplicateColumn(dup.to_string()));
        }
        let rows: Vec<(usize, usize)> = self
            .index
            .iter()
            .enumerate()
            .filter_map(|(i, ts)| other.position(*ts).map(|j| (i, j)))
            .collect();

        let mut joined = Self::new(rows.iter().map(|(i, _)| self.index[*i]).collect())?;
        for (key, values) in &self.columns {
            joined
                .columns
                .insert(key.clone(), rows.iter().map(|(i, _)| values[*i]).collect());
        }
        for (key, values) in &other.columns {
            joined
                .columns
                .insert(key.clone(), rows.iter().map(|(_, j)| values[*j]).collect());
        }
        Ok(joined)
    }
}
