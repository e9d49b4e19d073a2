use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::checks::{RegionReport, StructuralReport, StructuralWarning, ValidationSummary};
use super::stage::StageStore;
use super::StoreError;
use crate::domain::{ColumnKey, Field, Namespace, Region, TimeSeriesTable};

/// Regional view over one pipeline stage.
///
/// Wraps a [`TimeSeriesTable`] and one [`Namespace`]; the region list is
/// derived from the column keys of that namespace and kept sorted.
///
/// Consistency requirements (checked here, established by the reconciler):
/// - interchange is antisymmetric: `ID[i,j] == -ID[j,i]`
/// - total interchange closes: `TI[i] == sum_j ID[i,j]`
/// - balance: `NG[i] == D[i] + TI[i]`
/// - `D[i] >= 0`, `NG[i] >= 0`
#[derive(Debug, Clone)]
pub struct RegionalTimeSeriesStore {
    table: TimeSeriesTable,
    namespace: Namespace,
    regions: Vec<Region>,
}

impl RegionalTimeSeriesStore {
    /// Wrap an explicit table. Structural mismatches are logged, not fatal.
    pub fn new(table: TimeSeriesTable, namespace: Namespace) -> Self {
        let mut store = Self {
            table,
            namespace,
            regions: Vec::new(),
        };
        store.refresh_regions();
        store.structural_check().log();
        debug!(
            namespace = %namespace,
            regions = store.regions.len(),
            rows = store.table.len(),
            "store ready"
        );
        store
    }

    /// Load a named stage, keeping only the columns of `namespace`
    pub fn from_stage(stages: &StageStore, name: &str, namespace: Namespace) -> Result<Self, StoreError> {
        let table = stages.load(name)?;
        Ok(Self::new(table.select(|k| k.namespace() == namespace), namespace))
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Sorted region list
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn table(&self) -> &TimeSeriesTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut TimeSeriesTable {
        &mut self.table
    }

    pub fn into_table(self) -> TimeSeriesTable {
        self.table
    }

    /// Re-derive the region list after columns were added or removed
    pub fn refresh_regions(&mut self) {
        let namespace = self.namespace;
        let regions: BTreeSet<Region> = self
            .table
            .keys()
            .filter(|k| k.namespace() == namespace)
            .map(|k| k.region_id().clone())
            .collect();
        self.regions = regions.into_iter().collect();
    }

    pub fn has_region(&self, region: &Region) -> bool {
        self.regions.binary_search(region).is_ok()
    }

    /// Regional column key in this store's namespace
    pub fn key(&self, region: &Region, field: Field) -> ColumnKey {
        ColumnKey::region(self.namespace, region.clone(), field)
    }

    /// Interchange column key in this store's namespace
    pub fn pair_key(&self, from: &Region, to: &Region) -> ColumnKey {
        ColumnKey::pair(self.namespace, from.clone(), to.clone())
    }

    /// Column keys for `field` over `regions`, in region order.
    ///
    /// Regional fields are templated per region whether or not the column
    /// exists. For [`Field::Interchange`] every existing outgoing pair of each
    /// region is listed.
    pub fn columns_for(&self, regions: &[Region], field: Field) -> Vec<ColumnKey> {
        match field {
            Field::Interchange => regions
                .iter()
                .flat_map(|from| {
                    self.regions
                        .iter()
                        .map(move |to| self.pair_key(from, to))
                        .filter(|k| self.table.contains(k))
                })
                .collect(),
            field => regions.iter().map(|r| self.key(r, field)).collect(),
        }
    }

    /// Regions for which both interchange directions exist
    pub fn trade_partners(&self, region: &Region) -> Vec<Region> {
        self.regions
            .iter()
            .filter(|other| {
                self.table.contains(&self.pair_key(region, other))
                    && self.table.contains(&self.pair_key(other, region))
            })
            .cloned()
            .collect()
    }

    /// Column values or [`StoreError::MissingColumn`]
    pub fn require(&self, key: &ColumnKey) -> Result<&[Option<f64>], StoreError> {
        self.table
            .column(key)
            .ok_or_else(|| StoreError::MissingColumn(key.to_string()))
    }

    /// Compare column counts and region sets across D, NG, TI and ID
    pub fn structural_check(&self) -> StructuralReport {
        let regions_with = |field: Field| -> BTreeSet<Region> {
            self.table
                .keys()
                .filter(|k| k.namespace() == self.namespace && k.field() == field)
                .map(|k| k.region_id().clone())
                .collect()
        };
        let all: BTreeSet<Region> = self.regions.iter().cloned().collect();
        let demand = regions_with(Field::Demand);
        let generation = regions_with(Field::NetGeneration);

        let mut report = StructuralReport::default();
        if demand.len() != generation.len() {
            report.warnings.push(StructuralWarning::CountMismatch {
                field: Field::NetGeneration,
                reference: Field::Demand,
                count: generation.len(),
                reference_count: demand.len(),
            });
        }
        if generation != all {
            report.warnings.push(StructuralWarning::RegionSetMismatch {
                field: Field::NetGeneration,
                missing: all.difference(&generation).cloned().collect(),
                unexpected: generation.difference(&all).cloned().collect(),
            });
        }

        if !self.namespace.is_intensity() {
            let total = regions_with(Field::TotalInterchange);
            if total.len() != generation.len() {
                report.warnings.push(StructuralWarning::CountMismatch {
                    field: Field::TotalInterchange,
                    reference: Field::NetGeneration,
                    count: total.len(),
                    reference_count: generation.len(),
                });
            }
            let pairs: Vec<&ColumnKey> = self
                .table
                .keys()
                .filter(|k| k.namespace() == self.namespace && k.field() == Field::Interchange)
                .collect();
            let exporters: BTreeSet<Region> = pairs.iter().map(|k| k.region_id().clone()).collect();
            let importers: BTreeSet<Region> = pairs.iter().filter_map(|k| k.partner().cloned()).collect();
            for (importing_side, side) in [(false, exporters), (true, importers)] {
                if side != generation {
                    report.warnings.push(StructuralWarning::InterchangeSideMismatch {
                        importing_side,
                        missing: generation.difference(&side).cloned().collect(),
                        unexpected: side.difference(&generation).cloned().collect(),
                    });
                }
            }
        }
        report
    }

    /// Count missing samples and invariant violations for one region
    pub fn check_region(&self, region: &Region, tolerance: f64) -> RegionReport {
        let mut report = RegionReport::new(region.clone(), tolerance);
        let partners = self.trade_partners(region);

        let demand = self.tracked_column(&self.key(region, Field::Demand), &mut report);
        let generation = self.tracked_column(&self.key(region, Field::NetGeneration), &mut report);
        let total = self.tracked_column(&self.key(region, Field::TotalInterchange), &mut report);

        let outgoing: Vec<&[Option<f64>]> = partners
            .iter()
            .filter_map(|p| self.table.column(&self.pair_key(region, p)))
            .collect();
        for (partner, values) in partners.iter().zip(&outgoing) {
            let missing = values.iter().filter(|v| v.is_none()).count();
            if missing > 0 {
                report
                    .missing
                    .insert(self.pair_key(region, partner).to_string(), missing);
            }
        }

        if let (Some(d), Some(ng), Some(ti)) = (demand, generation, total) {
            report.balance_violations = (0..self.table.len())
                .filter(|&t| match (ng[t], d[t], ti[t]) {
                    (Some(ng), Some(d), Some(ti)) => (ng - d - ti).abs() > tolerance,
                    _ => false,
                })
                .count();
        }

        if let Some(ti) = total {
            report.closure_violations = (0..self.table.len())
                .filter(|&t| match ti[t] {
                    Some(ti) => {
                        let sum: f64 = outgoing.iter().filter_map(|c| c[t]).sum();
                        (ti - sum).abs() > tolerance
                    }
                    None => false,
                })
                .count();
        }

        for (partner, forward) in partners.iter().zip(&outgoing) {
            let Some(backward) = self.table.column(&self.pair_key(partner, region)) else {
                continue;
            };
            let count = forward
                .iter()
                .zip(backward)
                .filter(|(f, b)| matches!((f, b), (Some(f), Some(b)) if (f + b).abs() > tolerance))
                .count();
            if count > 0 {
                report.antisymmetry_violations.insert(partner.clone(), count);
            }
        }

        let negatives = |values: Option<&[Option<f64>]>| {
            values.map_or(0, |v| v.iter().filter(|x| matches!(x, Some(x) if *x < 0.0)).count())
        };
        report.negative_demand = negatives(demand);
        report.negative_generation = negatives(generation);

        if !report.is_clean() {
            debug!(region = %region, violations = report.total_violations(), "region check failed");
        }
        report
    }

    fn tracked_column<'a>(&'a self, key: &ColumnKey, report: &mut RegionReport) -> Option<&'a [Option<f64>]> {
        match self.table.column(key) {
            Some(values) => {
                let missing = values.iter().filter(|v| v.is_none()).count();
                if missing > 0 {
                    report.missing.insert(key.to_string(), missing);
                }
                Some(values)
            }
            None => {
                report.absent_columns.push(key.to_string());
                None
            }
        }
    }

    /// Structural check plus [`check_region`](Self::check_region) for every region
    pub fn validate(&self, tolerance: f64) -> ValidationSummary {
        let summary = ValidationSummary {
            structural: self.structural_check(),
            regions: self
                .regions
                .iter()
                .map(|r| self.check_region(r, tolerance))
                .collect(),
        };
        let dirty = summary.dirty_regions().count();
        if dirty > 0 {
            warn!(dirty, total = self.regions.len(), "validation found invariant violations");
        }
        summary
    }
}
