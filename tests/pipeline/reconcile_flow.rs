use std::fs;
use tempfile::TempDir;

use consumption_emissions::config::ReconcileStep;
use consumption_emissions::domain::{Field, Namespace};
use consumption_emissions::pipeline;
use consumption_emissions::store::{RegionalTimeSeriesStore, StageStore, StoreError};

use super::fixtures::*;

#[test]
fn test_standard_policy_cleans_raw_stage() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let stages = seed_stages(&config);

    let raw = RegionalTimeSeriesStore::from_stage(&stages, &config.pipeline.raw_stage, Namespace::Electricity).unwrap();
    assert!(!raw.validate(config.reconcile.tolerance).is_clean());

    let mut done = pipeline::reconcile_steps(&stages, &config).unwrap();
    assert_eq!(done.len(), 1);
    let reconciled = done.remove(0);
    assert!(!reconciled.report.has_failures(), "{:?}", reconciled.report.failures);
    assert!(reconciled.validation.is_clean(), "{:?}", reconciled.validation);

    // the persisted stage is the reconciled table, and it validates on reload
    let stored =
        RegionalTimeSeriesStore::from_stage(&stages, config.pipeline.reconciled_stage(), Namespace::Electricity).unwrap();
    assert!(stored.validate(config.reconcile.tolerance).is_clean());
    let table = stored.table();

    // A is the larger region, so B's reported tie wins on day one
    assert_eq!(table.value(&link("A", "B"), 0), Some(25.0));
    assert_eq!(table.value(&link("A", "B"), 24), Some(30.0));
    assert_eq!(table.value(&elec("A", Field::TotalInterchange), 0), Some(25.0));
    // padded, then filled from the week before
    assert_eq!(table.value(&elec("C", Field::Demand), 100), Some(80.0));
    assert_eq!(table.value(&elec("B", Field::NetGeneration), 201), Some(130.0));
    assert_eq!(table.value(&elec("B", Field::NetGeneration), 206), Some(130.0));
    // negative generation floored, demand follows to keep the balance
    assert_eq!(table.value(&elec("C", Field::NetGeneration), 50), Some(1.0));
    assert_eq!(table.value(&elec("C", Field::Demand), 50), Some(11.0));

    let report = config.paths.report_dir.join(format!("{}_report.json", config.pipeline.reconciled_stage()));
    let body: serde_json::Value = serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(body["source"], config.pipeline.raw_stage.as_str());
    assert_eq!(body["reconciliation"]["outcomes"].as_array().unwrap().len(), 2);
}

#[test]
fn test_reconciled_stage_is_written_once() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let stages = seed_stages(&config);

    pipeline::reconcile_steps(&stages, &config).unwrap();
    let err = pipeline::reconcile_steps(&stages, &config).unwrap_err();
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::StageExists(_))));
}

#[test]
fn test_missing_raw_stage() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let stages = StageStore::new(&config.paths.data_dir);

    let err = pipeline::reconcile_steps(&stages, &config).unwrap_err();
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::StageNotFound(_))));
}

#[test]
fn test_yaml_policy_file() {
    let dir = TempDir::new().unwrap();
    let policy_path = dir.path().join("policy.yaml");
    fs::write(
        &policy_path,
        r#"
rules:
  - rule: resolve_direction
    authoritative: A
    other: B
    tolerance: 0.0
  - rule: recompute_total_interchange
    region: A
  - rule: recompute_total_interchange
    region: B
"#,
    )
    .unwrap();
    let mut config = config_in(dir.path());
    config.pipeline.steps = vec![ReconcileStep::new("EBA_3").with_policy(&policy_path)];
    let policy = pipeline::step_policy(&config.pipeline.steps[0]).unwrap();
    assert_eq!(policy.rules.len(), 3);

    let stages = seed_stages(&config);
    let reconciled = pipeline::reconcile_stage(&stages, &config, "EBA_2", "EBA_3", &policy).unwrap();

    let table = &reconciled.table;
    // A authoritative this time: B's day-one view is overwritten
    assert_eq!(table.value(&link("B", "A"), 0), Some(-30.0));
    assert_eq!(table.value(&elec("A", Field::TotalInterchange), 0), Some(30.0));
    assert_eq!(table.value(&elec("B", Field::TotalInterchange), 0), Some(-20.0));
    // no gap filling in this policy
    assert_eq!(table.value(&elec("C", Field::Demand), 100), None);
    assert!(!reconciled.validation.is_clean());
}

#[test]
fn test_steps_chain_through_saved_stages() {
    let dir = TempDir::new().unwrap();
    // first pass zeroes the B-C tie for day one, second runs the standard fixes
    let first = dir.path().join("first.toml");
    fs::write(
        &first,
        r#"
[[rules]]
rule = "set_constant"
column = "EBA.B-C.ID.H"
window = { end = "2016-01-02T00:00:00Z" }
value = 0.0

[[rules]]
rule = "set_constant"
column = "EBA.C-B.ID.H"
window = { end = "2016-01-02T00:00:00Z" }
value = 0.0
"#,
    )
    .unwrap();
    let mut config = config_in(dir.path());
    config.pipeline.steps = vec![
        ReconcileStep::new("EBA_3").with_policy(&first),
        ReconcileStep::new("EBA_4"),
    ];
    assert!(config.validate().is_ok());
    let stages = seed_stages(&config);

    let done = pipeline::reconcile_steps(&stages, &config).unwrap();
    assert_eq!(done.len(), 2);
    assert_eq!(done[0].report.total_changed(), 48);
    // the first pass leaves the raw defects in place
    assert!(!done[0].validation.is_clean());
    assert!(done[1].validation.is_clean(), "{:?}", done[1].validation);

    let intermediate = stages.load("EBA_3").unwrap();
    assert_eq!(intermediate.value(&link("C", "B"), 0), Some(0.0));
    assert_eq!(intermediate.value(&elec("C", Field::Demand), 100), None);
    // the second pass read the first pass's output, not the raw stage
    assert_eq!(config.pipeline.reconciled_stage(), "EBA_4");
    let last = stages.load(config.pipeline.reconciled_stage()).unwrap();
    assert_eq!(last.value(&link("B", "C"), 23), Some(0.0));
    assert_eq!(last.value(&link("B", "C"), 24), Some(10.0));
    assert_eq!(last.value(&elec("C", Field::TotalInterchange), 23), Some(0.0));
    assert_eq!(last.value(&elec("C", Field::Demand), 100), Some(80.0));

    let report = config.paths.report_dir.join("EBA_4_report.json");
    let body: serde_json::Value = serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(body["source"], "EBA_3");
}
