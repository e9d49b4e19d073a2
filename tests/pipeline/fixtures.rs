use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;

use consumption_emissions::config::{Config, ReconcileStep};
use consumption_emissions::domain::{ColumnKey, Field, Namespace, Pollutant, Region, TimeSeriesTable};
use consumption_emissions::solver::ExecutorKind;
use consumption_emissions::store::StageStore;

/// Three weeks, enough for weekly gap lookups
pub const HOURS: usize = 24 * 7 * 3;

pub fn r(id: &str) -> Region {
    Region::new(id).unwrap()
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap()
}

pub fn elec(region: &str, field: Field) -> ColumnKey {
    ColumnKey::region(Namespace::Electricity, r(region), field)
}

pub fn link(from: &str, to: &str) -> ColumnKey {
    ColumnKey::pair(Namespace::Electricity, r(from), r(to))
}

pub fn emitted(pollutant: Pollutant, region: &str, field: Field) -> ColumnKey {
    ColumnKey::region(Namespace::Pollutant(pollutant), r(region), field)
}

/// A -> B 30, B -> C 10, with the kind of damage raw EIA data carries:
/// - B reports its A tie at -25 for the first day
/// - A's TI is stale (all zero)
/// - C's demand is missing for one hour
/// - B's generation is missing for seven hours in week two
/// - C reports negative generation for one hour
pub fn raw_electricity() -> TimeSeriesTable {
    let mut table = TimeSeriesTable::hourly(start(), HOURS).unwrap();
    let flat = |v: f64| vec![Some(v); HOURS];

    let mut c_demand = flat(80.0);
    c_demand[100] = None;
    let mut b_generation = flat(130.0);
    for v in &mut b_generation[200..207] {
        *v = None;
    }
    let mut c_generation = flat(70.0);
    c_generation[50] = Some(-20.0);
    let mut b_to_a = flat(-30.0);
    for v in &mut b_to_a[..24] {
        *v = Some(-25.0);
    }

    let columns = vec![
        (elec("A", Field::Demand), flat(200.0)),
        (elec("A", Field::NetGeneration), flat(230.0)),
        (elec("A", Field::TotalInterchange), flat(0.0)),
        (elec("B", Field::Demand), flat(150.0)),
        (elec("B", Field::NetGeneration), b_generation),
        (elec("B", Field::TotalInterchange), flat(-20.0)),
        (elec("C", Field::Demand), c_demand),
        (elec("C", Field::NetGeneration), c_generation),
        (elec("C", Field::TotalInterchange), flat(-10.0)),
        (link("A", "B"), flat(30.0)),
        (link("B", "A"), b_to_a),
        (link("B", "C"), flat(10.0)),
        (link("C", "B"), flat(-10.0)),
    ];
    for (key, values) in columns {
        table.insert(key, values).unwrap();
    }
    table
}

/// CO2 and SO2 production; SO2 of C is not reported at all
pub fn production() -> TimeSeriesTable {
    let mut table = TimeSeriesTable::hourly(start(), HOURS).unwrap();
    for (region, co2) in [("A", 100.0), ("B", 50.0), ("C", 30.0)] {
        table
            .insert(emitted(Pollutant::Co2, region, Field::NetGeneration), vec![Some(co2); HOURS])
            .unwrap();
    }
    for (region, so2) in [("A", 0.2), ("B", 0.1)] {
        table
            .insert(emitted(Pollutant::So2, region, Field::NetGeneration), vec![Some(so2); HOURS])
            .unwrap();
    }
    table
}

/// Configuration rooted in `dir`, sequential solver, one standard reconcile step
pub fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = dir.join("analysis");
    config.paths.report_dir = dir.join("reports");
    config.pipeline.steps = vec![ReconcileStep::new("EBA_3")];
    config.solver.executor = ExecutorKind::Sequential;
    config.attribution.pollutants = vec![Pollutant::Co2, Pollutant::So2];
    config
}

/// Write the raw and production stages named in `config`
pub fn seed_stages(config: &Config) -> StageStore {
    let stages = StageStore::new(&config.paths.data_dir);
    stages.save(&config.pipeline.raw_stage, &raw_electricity()).unwrap();
    stages.save(&config.pipeline.production_stage, &production()).unwrap();
    stages
}
