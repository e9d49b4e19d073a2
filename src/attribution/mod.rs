//! Consumption-based attribution over the full horizon

pub mod aggregator;
pub mod inputs;
pub mod resolution;

pub use aggregator::*;
pub use inputs::*;
pub use resolution::*;

use thiserror::Error;

use crate::domain::{DomainError, Namespace};
use crate::solver::SolverError;

#[derive(Debug, Error)]
pub enum AttributionError {
    #[error("Electricity store has no regions")]
    NoRegions,
    #[error("Expected a {expected} store, got {found}")]
    WrongNamespace { expected: Namespace, found: Namespace },
    #[error("Solver failed at {timestamp}: {source}")]
    Solver {
        timestamp: String,
        #[source]
        source: SolverError,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
}
