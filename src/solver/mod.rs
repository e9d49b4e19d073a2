//! Per-timestep consumption-based intensity solver
//!
//! One small dense system per timestamp and quantity; timesteps are
//! independent and are spread over a [`TimestepExecutor`].
pub mod executor;
pub mod system;

pub use executor::*;
pub use system::*;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolverError {
    #[error("Dimension mismatch: {what} has {actual} entries, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Non-finite input in {0}")]
    NonFiniteInput(&'static str),
    #[error("Singular system (condition number {condition:e}) after perturbation")]
    SingularSystem { condition: f64 },
    #[error("Perturbed region {index} solved to {value}, expected exactly zero")]
    PerturbationInvariantViolated { index: usize, value: f64 },
    #[error("Failed to start worker pool: {0}")]
    Executor(String),
}

impl SolverError {
    /// Errors that abort only the offending timestep
    pub fn is_timestep_local(&self) -> bool {
        matches!(self, SolverError::SingularSystem { .. } | SolverError::NonFiniteInput(_))
    }
}
