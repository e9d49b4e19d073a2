use serde::{Deserialize, Serialize};

use super::SolverError;
use crate::config::SolverConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Sequential,
    #[default]
    Parallel,
}

/// Maps a function over timestep indices, returning results in index order
pub trait TimestepExecutor: Send + Sync {
    fn map<T, F>(&self, len: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl TimestepExecutor for SequentialExecutor {
    fn map<T, F>(&self, len: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        (0..len).map(f).collect()
    }
}

/// Rayon worker pool owned by the executor
#[cfg(feature = "parallel")]
pub struct RayonExecutor {
    pool: rayon::ThreadPool,
}

#[cfg(feature = "parallel")]
impl RayonExecutor {
    /// `workers == 0` lets rayon pick one thread per core
    pub fn new(workers: usize) -> Result<Self, SolverError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("solver-{}", i))
            .build()
            .map_err(|e| SolverError::Executor(e.to_string()))?;
        let executor = Self { pool };
        tracing::debug!(threads = executor.threads(), "solver pool ready");
        Ok(executor)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[cfg(feature = "parallel")]
impl TimestepExecutor for RayonExecutor {
    fn map<T, F>(&self, len: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        use rayon::prelude::*;
        self.pool.install(|| (0..len).into_par_iter().map(&f).collect())
    }
}

/// Executor selected from configuration
pub enum Executor {
    Sequential(SequentialExecutor),
    #[cfg(feature = "parallel")]
    Parallel(RayonExecutor),
}

impl Executor {
    pub fn from_config(config: &SolverConfig) -> Result<Self, SolverError> {
        match config.executor {
            ExecutorKind::Sequential => Ok(Executor::Sequential(SequentialExecutor)),
            #[cfg(feature = "parallel")]
            ExecutorKind::Parallel => Ok(Executor::Parallel(RayonExecutor::new(config.workers)?)),
            #[cfg(not(feature = "parallel"))]
            ExecutorKind::Parallel => {
                tracing::warn!("built without the parallel feature, solving sequentially");
                Ok(Executor::Sequential(SequentialExecutor))
            }
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            Executor::Sequential(_) => ExecutorKind::Sequential,
            #[cfg(feature = "parallel")]
            Executor::Parallel(_) => ExecutorKind::Parallel,
        }
    }
}

impl TimestepExecutor for Executor {
    fn map<T, F>(&self, len: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        match self {
            Executor::Sequential(e) => e.map(len, f),
            #[cfg(feature = "parallel")]
            Executor::Parallel(e) => e.map(len, f),
        }
    }
}
