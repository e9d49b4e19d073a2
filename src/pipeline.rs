//! Pipeline stages.
//!
//! Each stage is a pure function from the prior stage's table (plus policy
//! and configuration) to a new table; the `*_stage` wrappers load the input
//! artifact, run the stage and persist a new artifact with its reports.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::attribution::{AttributionAggregator, AttributionResult, AttributionSummary};
use crate::config::{Config, ReconcileConfig, ReconcileStep};
use crate::domain::{Namespace, Pollutant, TimeSeriesTable};
use crate::reconcile::{Policy, PolicyRunner, ReconciliationReport};
use crate::solver::{Executor, TimestepExecutor};
use crate::store::{RegionalTimeSeriesStore, StageStore, ValidationSummary};

/// Reconciled electricity plus what it took to get there
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub table: TimeSeriesTable,
    pub report: ReconciliationReport,
    pub validation: ValidationSummary,
}

/// Apply `policy` to an electricity table and validate the result
pub fn reconcile(table: TimeSeriesTable, policy: &Policy, settings: &ReconcileConfig) -> Reconciled {
    let mut store = RegionalTimeSeriesStore::new(table.select(|k| k.namespace() == Namespace::Electricity), Namespace::Electricity);
    let report = PolicyRunner::new(settings).run(&mut store, policy);
    let validation = store.validate(settings.tolerance);
    validation.log();
    Reconciled {
        table: store.into_table(),
        report,
        validation,
    }
}

#[derive(Debug, Serialize)]
struct ReconcileReportFile<'a> {
    stage: &'a str,
    source: &'a str,
    reconciliation: &'a ReconciliationReport,
    validation: &'a ValidationSummary,
}

/// `source` → `target` through `policy`
#[instrument(level = "info", skip(stages, config, policy))]
pub fn reconcile_stage(stages: &StageStore, config: &Config, source: &str, target: &str, policy: &Policy) -> Result<Reconciled> {
    let raw = stages
        .load(source)
        .with_context(|| format!("loading stage {}", source))?;

    let reconciled = reconcile(raw, policy, &config.reconcile);
    if reconciled.report.has_failures() {
        warn!(failures = reconciled.report.failures.len(), "some reconciliation rules failed");
    }

    stages
        .save(target, &reconciled.table)
        .with_context(|| format!("writing stage {}", target))?;
    StageStore::new(&config.paths.report_dir)
        .write_report(
            &format!("{}_report", target),
            &ReconcileReportFile {
                stage: target,
                source,
                reconciliation: &reconciled.report,
                validation: &reconciled.validation,
            },
        )
        .context("writing reconciliation report")?;
    info!(
        changed = reconciled.report.total_changed(),
        clean = reconciled.validation.is_clean(),
        "reconciliation stage complete"
    );
    Ok(reconciled)
}

/// Policy of one step, loaded from its file or the standard one
pub fn step_policy(step: &ReconcileStep) -> Result<Policy> {
    match &step.policy_file {
        Some(path) => Policy::from_path(path).with_context(|| format!("policy for stage {}", step.stage)),
        None => {
            info!(stage = %step.stage, "no policy file configured, using standard fixes and final adjustment");
            Ok(Policy::standard())
        }
    }
}

/// Run every configured step in order, starting from `raw_stage`
pub fn reconcile_steps(stages: &StageStore, config: &Config) -> Result<Vec<Reconciled>> {
    let mut source = config.pipeline.raw_stage.as_str();
    let mut done = Vec::with_capacity(config.pipeline.steps.len());
    for step in &config.pipeline.steps {
        let policy = step_policy(step)?;
        done.push(reconcile_stage(stages, config, source, &step.stage, &policy)?);
        source = &step.stage;
    }
    Ok(done)
}

/// Attribute every configured pollutant over a reconciled electricity table
pub fn attribute<E: TimestepExecutor>(
    electricity: TimeSeriesTable,
    production: &TimeSeriesTable,
    config: &Config,
    executor: &E,
) -> Result<Vec<AttributionResult>> {
    let store = RegionalTimeSeriesStore::new(electricity, Namespace::Electricity);
    let aggregator = AttributionAggregator::new(executor, &config.attribution);
    config
        .attribution
        .pollutants
        .iter()
        .map(|pollutant| {
            aggregator
                .attribute(&store, production, *pollutant)
                .with_context(|| format!("attributing {}", pollutant))
        })
        .collect()
}

/// Output stage names for one pollutant
pub fn output_stages(config: &Config, pollutant: Pollutant) -> [String; 3] {
    let prefix = &config.pipeline.output_prefix;
    let level = config.attribution.resolution.suffix();
    [
        format!("{}_{}_{}", prefix, pollutant, level),
        format!("{}_E_{}", prefix, level),
        format!("{}_EFs_{}_{}", prefix, pollutant, level),
    ]
}

/// Last reconciled stage + `production_stage` → per-pollutant output stages
#[instrument(level = "info", skip_all, fields(resolution = config.attribution.resolution.suffix()))]
pub fn attribute_stage<E: TimestepExecutor>(stages: &StageStore, config: &Config, executor: &E) -> Result<Vec<AttributionSummary>> {
    let pipeline = &config.pipeline;
    let source = pipeline.reconciled_stage();
    let electricity = stages
        .load(source)
        .with_context(|| format!("loading stage {}", source))?;
    let production = stages
        .load(&pipeline.production_stage)
        .with_context(|| format!("loading stage {}", pipeline.production_stage))?;

    let results = attribute(electricity, &production, config, executor)?;
    let reports = StageStore::new(&config.paths.report_dir);
    let mut summaries = Vec::with_capacity(results.len());
    for result in &results {
        let [quantity, electricity, factors] = output_stages(config, result.pollutant);
        stages.save(&quantity, &result.quantity)?;
        // every pollutant solves over the same electricity table
        if !stages.exists(&electricity) {
            stages.save(&electricity, &result.electricity)?;
        }
        stages.save(&factors, &result.emission_factors)?;

        let summary = result.summary();
        reports
            .write_report(&format!("{}_summary", quantity), &summary)
            .context("writing attribution summary")?;
        if !summary.failures.is_empty() {
            warn!(pollutant = %result.pollutant, failures = summary.failures.len(), "timesteps left unsolved");
        }
        summaries.push(summary);
    }
    Ok(summaries)
}

/// Full run: reconcile, then attribute
pub fn run(config: &Config) -> Result<()> {
    let stages = StageStore::new(&config.paths.data_dir);
    reconcile_steps(&stages, config)?;
    let executor = Executor::from_config(&config.solver)?;
    let summaries = attribute_stage(&stages, config, &executor)?;
    info!(pollutants = summaries.len(), "pipeline complete");
    Ok(())
}
