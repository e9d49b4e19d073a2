//! Store-mutating reconciliation primitives and the policy layer that
//! sequences them

pub mod composite;
pub mod policy;
pub mod primitives;

pub use composite::*;
pub use policy::*;
pub use primitives::*;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::{DomainError, Field, Region};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Unknown region: {0}")]
    UnknownRegion(Region),
    #[error("Gap in {column} at {timestamp} is still missing after {attempts} weekly lookups")]
    GapUnfillable {
        column: String,
        timestamp: DateTime<Utc>,
        attempts: usize,
    },
    #[error("Field {field} is not supported by {operation}")]
    UnsupportedField { field: Field, operation: &'static str },
    #[error("Failed to read policy {path}: {message}")]
    Policy { path: PathBuf, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}
