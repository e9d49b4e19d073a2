//! Structural and invariant checks over a regional store.
//!
//! Nothing here fails: mismatches and violations are counted and reported so
//! the pipeline can summarize them once the run is over.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::domain::{Field, Region};

/// Column-layout mismatch between fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StructuralWarning {
    /// Two fields carry a different number of regional columns
    CountMismatch {
        field: Field,
        reference: Field,
        count: usize,
        reference_count: usize,
    },
    /// The regions carrying `field` differ from the derived region list
    RegionSetMismatch {
        field: Field,
        missing: Vec<Region>,
        unexpected: Vec<Region>,
    },
    /// Exporting or importing sides of interchange columns differ from the
    /// regions carrying net generation
    InterchangeSideMismatch {
        importing_side: bool,
        missing: Vec<Region>,
        unexpected: Vec<Region>,
    },
}

impl fmt::Display for StructuralWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralWarning::CountMismatch {
                field,
                reference,
                count,
                reference_count,
            } => write!(
                f,
                "inconsistent columns: {} {} columns vs {} {} columns",
                count, field, reference_count, reference
            ),
            StructuralWarning::RegionSetMismatch {
                field,
                missing,
                unexpected,
            } => write!(
                f,
                "inconsistent {} columns: missing {:?}, unexpected {:?}",
                field, missing, unexpected
            ),
            StructuralWarning::InterchangeSideMismatch {
                importing_side,
                missing,
                unexpected,
            } => write!(
                f,
                "inconsistent ID columns ({} side): missing {:?}, unexpected {:?}",
                if *importing_side { "importing" } else { "exporting" },
                missing,
                unexpected
            ),
        }
    }
}

/// Result of [`RegionalTimeSeriesStore::structural_check`](super::RegionalTimeSeriesStore::structural_check)
#[derive(Debug, Clone, Default, Serialize)]
pub struct StructuralReport {
    pub warnings: Vec<StructuralWarning>,
}

impl StructuralReport {
    pub fn is_consistent(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn log(&self) {
        for w in &self.warnings {
            warn!(warning = %w, "structural inconsistency");
        }
    }
}

/// Violation counts for one region
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionReport {
    pub region: Region,
    pub tolerance: f64,
    /// Expected columns that do not exist at all
    pub absent_columns: Vec<String>,
    /// Missing samples per column
    pub missing: BTreeMap<String, usize>,
    /// `|NG - D - TI| > tol`
    pub balance_violations: usize,
    /// `|TI - sum(ID)| > tol`
    pub closure_violations: usize,
    /// `|ID[i,j] + ID[j,i]| > tol`, per partner
    pub antisymmetry_violations: BTreeMap<Region, usize>,
    pub negative_demand: usize,
    pub negative_generation: usize,
}

impl RegionReport {
    pub fn new(region: Region, tolerance: f64) -> Self {
        Self {
            region,
            tolerance,
            absent_columns: Vec::new(),
            missing: BTreeMap::new(),
            balance_violations: 0,
            closure_violations: 0,
            antisymmetry_violations: BTreeMap::new(),
            negative_demand: 0,
            negative_generation: 0,
        }
    }

    pub fn missing_samples(&self) -> usize {
        self.missing.values().sum()
    }

    pub fn antisymmetry_total(&self) -> usize {
        self.antisymmetry_violations.values().sum()
    }

    pub fn total_violations(&self) -> usize {
        self.absent_columns.len()
            + self.missing_samples()
            + self.balance_violations
            + self.closure_violations
            + self.antisymmetry_total()
            + self.negative_demand
            + self.negative_generation
    }

    pub fn is_clean(&self) -> bool {
        self.total_violations() == 0
    }
}

/// End-of-pipeline validation summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    pub structural: StructuralReport,
    pub regions: Vec<RegionReport>,
}

impl ValidationSummary {
    pub fn dirty_regions(&self) -> impl Iterator<Item = &RegionReport> {
        self.regions.iter().filter(|r| !r.is_clean())
    }

    pub fn is_clean(&self) -> bool {
        self.structural.is_consistent() && self.dirty_regions().next().is_none()
    }

    /// Log every violation at warn level
    pub fn log(&self) {
        self.structural.log();
        for report in self.dirty_regions() {
            warn!(
                region = %report.region,
                absent = ?report.absent_columns,
                missing = report.missing_samples(),
                balance = report.balance_violations,
                closure = report.closure_violations,
                antisymmetry = ?report.antisymmetry_violations,
                negative_demand = report.negative_demand,
                negative_generation = report.negative_generation,
                "invariant violations"
            );
        }
    }
}
