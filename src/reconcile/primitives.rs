use chrono::Duration;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::ops::Range;
use tracing::{debug, warn};

use super::ReconcileError;
use crate::config::ReconcileConfig;
use crate::domain::{ColumnKey, Field, Region, Series, TimeWindow};
use crate::store::{RegionalTimeSeriesStore, StoreError};

/// Trusted side of an interchange pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    First,
    Second,
}

/// Field recomputed by [`Reconciler::enforce_balance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceTarget {
    /// `D = NG - TI`
    Demand,
    /// `NG = D + TI`
    Generation,
}

/// Explicit outlier bounds; a missing side is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlierReport {
    pub column: String,
    pub removed: usize,
    /// Window statistics, when no explicit bounds were given
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    /// Removed count exceeded the soft threshold
    pub escalated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapFillReport {
    pub column: String,
    pub padded: usize,
    pub weekly: usize,
    /// Gaps left after padding exceeded the soft threshold
    pub escalated: bool,
}

impl GapFillReport {
    pub fn filled(&self) -> usize {
        self.padded + self.weekly
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClampReport {
    pub to_missing: usize,
    pub to_zero: usize,
}

/// In-place reconciliation primitives over one store.
///
/// Every primitive is driven purely by its arguments. Sequencing (and knowing
/// which side of a pair to trust) belongs to the caller, normally the
/// [`PolicyRunner`](super::PolicyRunner).
pub struct Reconciler<'a> {
    store: &'a mut RegionalTimeSeriesStore,
    settings: &'a ReconcileConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a mut RegionalTimeSeriesStore, settings: &'a ReconcileConfig) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &RegionalTimeSeriesStore {
        self.store
    }

    pub fn settings(&self) -> &ReconcileConfig {
        self.settings
    }

    /// Overwrite the untrusted direction of a pair with the negated trusted one
    /// wherever it is missing or `|ID[a,b] + ID[b,a]| > tolerance` within
    /// `window`. Returns the number of changed samples.
    pub fn resolve_direction(
        &mut self,
        region_a: &Region,
        region_b: &Region,
        window: &TimeWindow,
        tolerance: f64,
        authoritative: Authority,
    ) -> Result<usize, ReconcileError> {
        let (trusted, other) = match authoritative {
            Authority::First => (region_a, region_b),
            Authority::Second => (region_b, region_a),
        };
        let source = self.column(&self.store.pair_key(trusted, other))?;
        let target_key = self.store.pair_key(other, trusted);
        let range = self.store.table().window_range(window);
        let target = self.column_mut(&target_key)?;

        let mut changed = 0;
        for t in range {
            let disagree = match (source[t], target[t]) {
                (_, None) => true,
                (Some(s), Some(o)) => (s + o).abs() > tolerance,
                (None, Some(_)) => false,
            };
            let replacement = source[t].map(|v| -v);
            if disagree && replacement != target[t] {
                target[t] = replacement;
                changed += 1;
            }
        }
        debug!(column = %target_key, trusted = %trusted, changed, "direction resolved");
        Ok(changed)
    }

    /// Replace samples outside `bounds`, or outside mean ± 3σ of the window
    /// when no bounds are given, with `replace_with` (missing when `None`)
    pub fn reject_outliers(
        &mut self,
        column: &ColumnKey,
        window: &TimeWindow,
        bounds: Option<Bounds>,
        replace_with: Option<f64>,
    ) -> Result<OutlierReport, ReconcileError> {
        let range = self.store.table().window_range(window);
        let threshold = self.settings.outlier_warn_threshold;
        let values = self.column_mut(column)?;

        let (lower, upper, mean, std_dev) = match bounds {
            Some(b) => (
                b.lower.unwrap_or(f64::NEG_INFINITY),
                b.upper.unwrap_or(f64::INFINITY),
                None,
                None,
            ),
            None => {
                let present: Vec<f64> = values[range.clone()].iter().flatten().copied().collect();
                let mean = present.iter().mean();
                let std_dev = present.iter().std_dev();
                // NaN bounds (fewer than two samples) flag nothing
                (
                    mean - 3.0 * std_dev,
                    mean + 3.0 * std_dev,
                    Some(mean).filter(|m| m.is_finite()),
                    Some(std_dev).filter(|s| s.is_finite()),
                )
            }
        };

        let mut removed = 0;
        for v in &mut values[range] {
            if matches!(v, Some(x) if *x < lower || *x > upper) {
                *v = replace_with;
                removed += 1;
            }
        }

        let escalated = removed > threshold;
        if escalated {
            warn!(column = %column, removed, threshold, "many outliers removed");
        } else {
            debug!(column = %column, removed, "outliers removed");
        }
        Ok(OutlierReport {
            column: column.to_string(),
            removed,
            mean,
            std_dev,
            escalated,
        })
    }

    /// Forward-fill runs of up to `pad_limit` missing hours, then fill what is
    /// left from the same hour one week earlier, or 1..=`weekly_limit` weeks
    /// later. On [`ReconcileError::GapUnfillable`] the column is left untouched.
    pub fn fill_gaps(
        &mut self,
        column: &ColumnKey,
        pad_limit: usize,
        weekly_limit: usize,
    ) -> Result<GapFillReport, ReconcileError> {
        let mut values = self.column(column)?;
        let padded = forward_fill(&mut values, 0..usize::MAX, pad_limit);

        let residual = values.iter().filter(|v| v.is_none()).count();
        let escalated = residual > self.settings.gap_warn_threshold;
        if escalated {
            warn!(column = %column, residual, "many gaps left after padding");
        }

        let table = self.store.table();
        let week = Duration::weeks(1);
        let mut weekly = 0;
        for t in 0..values.len() {
            if values[t].is_some() {
                continue;
            }
            let ts = table.index()[t];
            let found = std::iter::once(-1)
                .chain(1..=weekly_limit as i32)
                .filter_map(|k| table.position(ts + week * k))
                .find_map(|pos| values[pos]);
            match found {
                Some(x) => {
                    values[t] = Some(x);
                    weekly += 1;
                }
                None => {
                    return Err(ReconcileError::GapUnfillable {
                        column: column.to_string(),
                        timestamp: ts,
                        attempts: weekly_limit + 1,
                    })
                }
            }
        }

        self.column_mut(column)?.copy_from_slice(&values);
        debug!(column = %column, padded, weekly, "gaps filled");
        Ok(GapFillReport {
            column: column.to_string(),
            padded,
            weekly,
            escalated,
        })
    }

    /// Forward-fill the first `limit` samples of every missing run inside
    /// `window`. Longer runs keep their tail missing. Returns the number of
    /// filled samples.
    pub fn pad(&mut self, column: &ColumnKey, window: &TimeWindow, limit: usize) -> Result<usize, ReconcileError> {
        let range = self.store.table().window_range(window);
        let values = self.column_mut(column)?;
        let padded = forward_fill(values, range, limit);
        debug!(column = %column, padded, limit, "column padded");
        Ok(padded)
    }

    /// Overwrite every sample of `column` inside `window` with `value`.
    /// Returns the number of changed samples.
    pub fn set_constant(&mut self, column: &ColumnKey, window: &TimeWindow, value: f64) -> Result<usize, ReconcileError> {
        let rows: Vec<usize> = self
            .store
            .table()
            .index()
            .iter()
            .enumerate()
            .filter(|(_, ts)| window.contains(**ts))
            .map(|(pos, _)| pos)
            .collect();
        let values = self.column_mut(column)?;
        let mut changed = 0;
        for pos in rows {
            if values[pos] != Some(value) {
                values[pos] = Some(value);
                changed += 1;
            }
        }
        debug!(column = %column, value, changed, "column set to constant");
        Ok(changed)
    }

    /// `TI[region] = Σ ID[region, partner]` over trade partners, missing
    /// interchange counted as zero. Returns the number of changed samples.
    pub fn recompute_total_interchange(&mut self, region: &Region) -> Result<usize, ReconcileError> {
        self.ensure_region(region)?;
        let outgoing: Vec<Series> = self
            .store
            .trade_partners(region)
            .iter()
            .map(|p| self.column(&self.store.pair_key(region, p)))
            .collect::<Result<_, _>>()?;
        let total: Series = (0..self.store.table().len())
            .map(|t| Some(outgoing.iter().filter_map(|c| c[t]).sum()))
            .collect();

        let key = self.store.key(region, Field::TotalInterchange);
        self.replace(key, total)
    }

    /// Recompute demand or generation from the balance `NG = D + TI`
    pub fn enforce_balance(&mut self, region: &Region, target: BalanceTarget) -> Result<usize, ReconcileError> {
        self.ensure_region(region)?;
        let total = self.column(&self.store.key(region, Field::TotalInterchange))?;
        let (source_field, target_field, sign) = match target {
            BalanceTarget::Demand => (Field::NetGeneration, Field::Demand, -1.0),
            BalanceTarget::Generation => (Field::Demand, Field::NetGeneration, 1.0),
        };
        let source = self.column(&self.store.key(region, source_field))?;
        let balanced: Series = source
            .iter()
            .zip(&total)
            .map(|(s, ti)| s.zip(*ti).map(|(s, ti)| s + sign * ti))
            .collect();

        let key = self.store.key(region, target_field);
        self.replace(key, balanced)
    }

    /// Lift negative demand (or generation) to `floor`, moving the counterpart
    /// by the same amount so the balance still holds
    pub fn floor_negatives(&mut self, region: &Region, field: Field, floor: f64) -> Result<usize, ReconcileError> {
        let counterpart = match field {
            Field::Demand => Field::NetGeneration,
            Field::NetGeneration => Field::Demand,
            field => {
                return Err(ReconcileError::UnsupportedField {
                    field,
                    operation: "floor_negatives",
                })
            }
        };
        self.ensure_region(region)?;
        let key = self.store.key(region, field);
        let other_key = self.store.key(region, counterpart);
        let mut values = self.column(&key)?;
        let mut other = self.column(&other_key)?;

        let mut changed = 0;
        for (v, o) in values.iter_mut().zip(other.iter_mut()) {
            if let Some(x) = *v {
                if x < 0.0 {
                    let shift = floor - x;
                    *v = Some(floor);
                    *o = o.map(|c| c + shift);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.column_mut(&key)?.copy_from_slice(&values);
            self.column_mut(&other_key)?.copy_from_slice(&other);
            debug!(region = %region, field = %field, changed, "negatives floored");
        }
        Ok(changed)
    }

    /// Across all regions, values below `-hard_limit` become missing and values
    /// in `[-hard_limit, 0)` become zero
    pub fn clamp_negatives(&mut self, field: Field, hard_limit: f64) -> Result<ClampReport, ReconcileError> {
        if !matches!(field, Field::Demand | Field::NetGeneration) {
            return Err(ReconcileError::UnsupportedField {
                field,
                operation: "clamp_negatives",
            });
        }
        let keys = self.store.columns_for(self.store.regions(), field);
        let mut report = ClampReport::default();
        for key in keys {
            let Some(values) = self.store.table_mut().column_mut(&key) else {
                continue;
            };
            for v in values.iter_mut() {
                match *v {
                    Some(x) if x < -hard_limit => {
                        *v = None;
                        report.to_missing += 1;
                    }
                    Some(x) if x < 0.0 => {
                        *v = Some(0.0);
                        report.to_zero += 1;
                    }
                    _ => {}
                }
            }
        }
        debug!(field = %field, to_missing = report.to_missing, to_zero = report.to_zero, "negatives clamped");
        Ok(report)
    }

    /// Shift a region's D, NG, TI and outgoing interchange within `window` so
    /// that `new[t] = old[t + lead_hours]`. Samples pulled from outside the
    /// window become missing. Returns the number of shifted columns.
    pub fn shift_series(&mut self, region: &Region, window: &TimeWindow, lead_hours: i64) -> Result<usize, ReconcileError> {
        self.ensure_region(region)?;
        let range = self.store.table().window_range(window);
        let mut keys: Vec<ColumnKey> = Field::REGIONAL
            .iter()
            .map(|f| self.store.key(region, *f))
            .filter(|k| self.store.table().contains(k))
            .collect();
        keys.extend(self.store.columns_for(std::slice::from_ref(region), Field::Interchange));

        for key in &keys {
            let old = self.column(key)?;
            let values = self.column_mut(key)?;
            for t in range.clone() {
                let source = t as i64 + lead_hours;
                values[t] = if source >= range.start as i64 && source < range.end as i64 {
                    old[source as usize]
                } else {
                    None
                };
            }
        }
        debug!(region = %region, lead_hours, columns = keys.len(), "series shifted");
        Ok(keys.len())
    }

    /// Spread `(target_total - Σ field) / rows` over every present sample.
    /// Returns the per-sample correction.
    pub fn distribute_correction(&mut self, region: &Region, field: Field, target_total: f64) -> Result<f64, ReconcileError> {
        if field == Field::Interchange {
            return Err(ReconcileError::UnsupportedField {
                field,
                operation: "distribute_correction",
            });
        }
        self.ensure_region(region)?;
        let rows = self.store.table().len();
        if rows == 0 {
            return Ok(0.0);
        }
        let key = self.store.key(region, field);
        let values = self.column_mut(&key)?;
        let current: f64 = values.iter().flatten().sum();
        let correction = (target_total - current) / rows as f64;
        for v in values.iter_mut().flatten() {
            *v += correction;
        }
        debug!(column = %key, correction, "correction distributed");
        Ok(correction)
    }

    fn ensure_region(&self, region: &Region) -> Result<(), ReconcileError> {
        if self.store.has_region(region) {
            Ok(())
        } else {
            Err(ReconcileError::UnknownRegion(region.clone()))
        }
    }

    fn column(&self, key: &ColumnKey) -> Result<Series, ReconcileError> {
        Ok(self.store.require(key)?.to_vec())
    }

    fn column_mut(&mut self, key: &ColumnKey) -> Result<&mut [Option<f64>], ReconcileError> {
        self.store
            .table_mut()
            .column_mut(key)
            .ok_or_else(|| StoreError::MissingColumn(key.to_string()).into())
    }

    /// Insert or replace a derived column, counting changed samples
    fn replace(&mut self, key: ColumnKey, values: Series) -> Result<usize, ReconcileError> {
        let previous = self.store.table_mut().insert(key.clone(), values.clone())?;
        let changed = match previous {
            Some(old) => old.iter().zip(&values).filter(|(a, b)| a != b).count(),
            None => values.len(),
        };
        debug!(column = %key, changed, "column recomputed");
        Ok(changed)
    }
}

/// Pad missing samples at rows in `range` from the last present value, at
/// most `limit` per run. The run is counted from the last present value even
/// when it starts before `range`.
fn forward_fill(values: &mut [Option<f64>], range: Range<usize>, limit: usize) -> usize {
    let end = range.end.min(values.len());
    let mut padded = 0;
    let mut last = None;
    let mut run = 0;
    for (t, v) in values[..end].iter_mut().enumerate() {
        match *v {
            Some(x) => {
                last = Some(x);
                run = 0;
            }
            None => {
                run += 1;
                if let (Some(x), true) = (last, run <= limit && t >= range.start) {
                    *v = Some(x);
                    padded += 1;
                }
            }
        }
    }
    padded
}
