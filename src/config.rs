use anyhow::{bail, Context, Result};
use figment::{providers::{Env, Format, Serialized, Toml}, Figment};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::attribution::Resolution;
use crate::domain::{Namespace, Pollutant};
use crate::solver::ExecutorKind;

/// Process-wide configuration, built once in `main` and passed down
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub reconcile: ReconcileConfig,
    pub solver: SolverConfig,
    pub attribution: AttributionConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding every stage artifact
    pub data_dir: PathBuf,
    /// Directory for JSON reports
    pub report_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/analysis"),
            report_dir: PathBuf::from("data/reports"),
        }
    }
}

/// Reconciler thresholds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReconcileConfig {
    /// Default tolerance for direction resolution and invariant checks (MWh)
    #[validate(range(min = 0.0))]
    pub tolerance: f64,
    /// Forward-fill limit in consecutive hours
    pub pad_limit: usize,
    /// Weekly lookups before a gap is declared unfillable
    #[validate(range(min = 1))]
    pub weekly_limit: usize,
    /// Removed-outlier count above which a rule is escalated to a warning
    pub outlier_warn_threshold: usize,
    /// Residual-gap count above which a fill is escalated to a warning
    pub gap_warn_threshold: usize,
    /// Positive floor for negative demand/generation
    #[validate(range(min = 0.0))]
    pub balance_floor: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tolerance: 1.0,
            pad_limit: 2,
            weekly_limit: 3,
            outlier_warn_threshold: 10,
            gap_warn_threshold: 50,
            balance_floor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolverConfig {
    pub executor: ExecutorKind,
    /// Worker threads for the parallel executor, 0 = one per core
    pub workers: usize,
}

/// Fill values for missing or zero attribution inputs
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FloorConfig {
    #[validate(range(min = 0.0))]
    pub electricity: f64,
    #[validate(range(min = 0.0))]
    pub co2: f64,
    #[validate(range(min = 0.0))]
    pub so2: f64,
    #[validate(range(min = 0.0))]
    pub nox: f64,
}

impl FloorConfig {
    pub fn for_namespace(&self, namespace: Namespace) -> f64 {
        match namespace {
            Namespace::Electricity => self.electricity,
            Namespace::Pollutant(p) | Namespace::Intensity(p) => match p {
                Pollutant::Co2 => self.co2,
                Pollutant::So2 => self.so2,
                Pollutant::Nox => self.nox,
            },
        }
    }
}

impl Default for FloorConfig {
    fn default() -> Self {
        Self {
            electricity: 1.0,
            co2: 0.01,
            so2: 1e-5,
            nox: 1e-5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AttributionConfig {
    pub pollutants: Vec<Pollutant>,
    pub resolution: Resolution,
    /// Multiplier applied to emission factors (t/MWh to kg/MWh)
    #[validate(range(min = 0.0))]
    pub emission_factor_scale: f64,
    pub floors: FloorConfig,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            pollutants: vec![Pollutant::Co2, Pollutant::So2, Pollutant::Nox],
            resolution: Resolution::Hourly,
            emission_factor_scale: 1000.0,
            floors: FloorConfig::default(),
        }
    }
}

/// One reconciliation pass over the previous stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileStep {
    /// Stage written by this step
    pub stage: String,
    /// Declarative reconciliation rules (TOML or YAML); standard fixes and
    /// final adjustment when absent
    #[serde(default)]
    pub policy_file: Option<PathBuf>,
}

impl ReconcileStep {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            policy_file: None,
        }
    }

    pub fn with_policy(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_file = Some(path.into());
        self
    }
}

/// Stage names read and written by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub raw_stage: String,
    /// Applied in order, each reading the stage the previous one wrote
    pub steps: Vec<ReconcileStep>,
    pub production_stage: String,
    pub output_prefix: String,
}

impl PipelineConfig {
    /// Stage attribution reads: the last step's output, or the raw stage
    pub fn reconciled_stage(&self) -> &str {
        self.steps.last().map_or(self.raw_stage.as_str(), |s| s.stage.as_str())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = vec![self.raw_stage.as_str(), self.production_stage.as_str()];
        for step in &self.steps {
            if seen.contains(&step.stage.as_str()) {
                bail!("reconcile step {} would overwrite an earlier stage", step.stage);
            }
            seen.push(step.stage.as_str());
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_stage: "EBA_2".to_string(),
            steps: vec![ReconcileStep::new("EBA_3")],
            production_stage: "AMPD_2".to_string(),
            output_prefix: "SEED".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then `config/default.toml`, then `SEED__*` environment variables
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SEED__").split("__"));
        let cfg: Config = figment
            .extract()
            .with_context(|| format!("invalid configuration ({})", path.as_ref().display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.reconcile.validate().context("reconcile")?;
        self.attribution.validate().context("attribution")?;
        self.attribution.floors.validate().context("attribution.floors")?;
        self.pipeline.validate().context("pipeline")?;
        Ok(())
    }
}
