use std::fs;
use tempfile::TempDir;

use consumption_emissions::attribution::Resolution;
use consumption_emissions::config::{Config, ReconcileStep};
use consumption_emissions::domain::{ColumnKey, Field, Namespace, Pollutant};
use consumption_emissions::pipeline;
use consumption_emissions::solver::SequentialExecutor;
use consumption_emissions::store::{RegionalTimeSeriesStore, StageStore};

use super::fixtures::*;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-6 * (1.0 + a.abs().max(b.abs()))
}

fn reconciled(config: &Config) -> StageStore {
    let stages = seed_stages(config);
    pipeline::reconcile_steps(&stages, config).unwrap();
    stages
}

#[test]
fn test_attributed_tables_balance() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let stages = reconciled(&config);

    let summaries = pipeline::attribute_stage(&stages, &config, &SequentialExecutor).unwrap();
    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert!(summary.failures.is_empty(), "{:?}", summary.failures);
        assert_eq!(summary.timesteps, HOURS);
    }

    let [quantity, electricity, factors] = pipeline::output_stages(&config, Pollutant::Co2);
    assert_eq!(quantity, "SEED_CO2_H");
    assert!(stages.exists(&electricity));
    assert!(stages.exists(&factors));

    let co2 = RegionalTimeSeriesStore::from_stage(&stages, &quantity, Namespace::Pollutant(Pollutant::Co2)).unwrap();
    let table = co2.table();
    for t in 0..table.len() {
        let mut consumed = 0.0;
        for region in ["A", "B", "C"] {
            let value = |field| table.value(&emitted(Pollutant::Co2, region, field), t).unwrap();
            let (d, ng, ti) = (value(Field::Demand), value(Field::NetGeneration), value(Field::TotalInterchange));
            assert!(close(ng, d + ti), "{} at {}: {} != {} + {}", region, t, ng, d, ti);
            consumed += d;
        }
        assert!(close(consumed, 180.0), "hour {}: {}", t, consumed);
    }

    // attributed trade is antisymmetric
    let ab = ColumnKey::pair(Namespace::Pollutant(Pollutant::Co2), r("A"), r("B"));
    let ba = ColumnKey::pair(Namespace::Pollutant(Pollutant::Co2), r("B"), r("A"));
    assert!(close(table.value(&ab, 30).unwrap(), -table.value(&ba, 30).unwrap()));
}

#[test]
fn test_emission_factors_stage() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let stages = reconciled(&config);
    pipeline::attribute_stage(&stages, &config, &SequentialExecutor).unwrap();

    let [_, _, factors] = pipeline::output_stages(&config, Pollutant::Co2);
    let efs = stages.load(&factors).unwrap();
    let intensity = Namespace::Intensity(Pollutant::Co2);
    let produced = ColumnKey::region(intensity, r("A"), Field::NetGeneration);
    let consumed = ColumnKey::region(intensity, r("A"), Field::Demand);
    // A only exports: its consumed intensity is its produced intensity
    let scale = config.attribution.emission_factor_scale;
    assert!(close(efs.value(&produced, 30).unwrap(), scale * 100.0 / 230.0));
    assert!(close(efs.value(&consumed, 30).unwrap(), scale * 100.0 / 230.0));
}

#[test]
fn test_unreported_pollutant_region_uses_floor() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let stages = reconciled(&config);
    pipeline::attribute_stage(&stages, &config, &SequentialExecutor).unwrap();

    let [quantity, ..] = pipeline::output_stages(&config, Pollutant::So2);
    let so2 = stages.load(&quantity).unwrap();
    let value = so2.value(&emitted(Pollutant::So2, "C", Field::NetGeneration), 0).unwrap();
    assert!(close(value, config.attribution.floors.so2));
}

#[test]
fn test_monthly_outputs_and_summary() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(dir.path());
    config.attribution.resolution = Resolution::Monthly;
    config.attribution.pollutants = vec![Pollutant::Co2];
    let stages = reconciled(&config);

    pipeline::attribute_stage(&stages, &config, &SequentialExecutor).unwrap();
    let [quantity, electricity, _] = pipeline::output_stages(&config, Pollutant::Co2);
    assert_eq!(quantity, "SEED_CO2_M");
    assert_eq!(electricity, "SEED_E_M");

    // three weeks of January fit in one month
    let monthly = stages.load(&quantity).unwrap();
    assert_eq!(monthly.len(), 1);
    let total = monthly.value(&emitted(Pollutant::Co2, "A", Field::NetGeneration), 0).unwrap();
    assert!(close(total, 100.0 * HOURS as f64));

    let summary = config.paths.report_dir.join(format!("{}_summary.json", quantity));
    let body: serde_json::Value = serde_json::from_str(&fs::read_to_string(summary).unwrap()).unwrap();
    assert_eq!(body["pollutant"], "CO2");
    assert_eq!(body["timesteps"], 1);
}

#[test]
fn test_full_run() {
    let dir = TempDir::new().unwrap();
    let policy_path = dir.path().join("policy.toml");
    fs::write(&policy_path, "[[rules]]\nrule = \"standard_fixes\"\n\n[[rules]]\nrule = \"final_adjust\"\n").unwrap();
    let mut config = config_in(dir.path());
    config.pipeline.steps = vec![ReconcileStep::new("EBA_3").with_policy(policy_path)];
    let stages = seed_stages(&config);

    pipeline::run(&config).unwrap();
    for pollutant in [Pollutant::Co2, Pollutant::So2] {
        for stage in pipeline::output_stages(&config, pollutant) {
            assert!(stages.exists(&stage), "{} missing", stage);
        }
    }
    assert!(pipeline::run(&config).is_err());
}
