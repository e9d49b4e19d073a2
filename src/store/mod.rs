//! Regional time-series store and stage persistence

pub mod checks;
pub mod regional;
pub mod stage;

pub use checks::*;
pub use regional::*;
pub use stage::*;

use std::path::PathBuf;
use thiserror::Error;

use crate::domain::DomainError;

/// Store and persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Missing column: {0}")]
    MissingColumn(String),
    #[error("Stage {0} not found")]
    StageNotFound(String),
    #[error("Stage {0} already exists and stages are append-only")]
    StageExists(String),
    #[error("Invalid timestamp {value:?} at row {row}")]
    InvalidTimestamp { row: usize, value: String },
    #[error("Invalid value {value:?} in column {column} at row {row}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Report serialization failed: {0}")]
    Report(#[source] serde_json::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
}
