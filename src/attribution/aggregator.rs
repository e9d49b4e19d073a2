use chrono::{DateTime, Utc};
use itertools::Itertools;
use nalgebra::DMatrix;
use serde::Serialize;
use tracing::{error, info, instrument};

use super::inputs::{prepare, PreparedInputs};
use super::resolution::Resolution;
use super::AttributionError;
use crate::config::AttributionConfig;
use crate::domain::{ColumnKey, Field, Namespace, Pollutant, Series, TimeSeriesTable};
use crate::solver::{ConsumptionEmissionsSolver, Solution, SolverError, TimestepExecutor};
use crate::store::RegionalTimeSeriesStore;

/// A timestep whose outputs were left missing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestepFailure {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// Output tables of one pollutant at one resolution
#[derive(Debug, Clone)]
pub struct AttributionResult {
    pub pollutant: Pollutant,
    pub resolution: Resolution,
    /// `<P>_<r>_D` consumption, `<P>_<r>_NG` production, `<P>_<r>_TI` and
    /// `<P>_<a>-<b>_ID` attributed trade
    pub quantity: TimeSeriesTable,
    /// Electricity inputs as solved (after filling and aggregation)
    pub electricity: TimeSeriesTable,
    /// `<P>i_<r>_D` consumption and `<P>i_<r>_NG` production factors, scaled
    pub emission_factors: TimeSeriesTable,
    pub failures: Vec<TimestepFailure>,
    /// Timesteps with at least one pinned region
    pub perturbed_timesteps: usize,
    /// Pinned (timestep, region) pairs
    pub perturbed_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttributionSummary {
    pub pollutant: Pollutant,
    pub resolution: Resolution,
    pub timesteps: usize,
    pub failures: Vec<TimestepFailure>,
    pub perturbed_timesteps: usize,
    pub perturbed_total: usize,
}

impl AttributionResult {
    pub fn summary(&self) -> AttributionSummary {
        AttributionSummary {
            pollutant: self.pollutant,
            resolution: self.resolution,
            timesteps: self.quantity.len(),
            failures: self.failures.clone(),
            perturbed_timesteps: self.perturbed_timesteps,
            perturbed_total: self.perturbed_total,
        }
    }
}

/// Runs the solver once per timestep and derives the attributed tables
pub struct AttributionAggregator<'a, E: TimestepExecutor> {
    solver: ConsumptionEmissionsSolver,
    executor: &'a E,
    config: &'a AttributionConfig,
}

impl<'a, E: TimestepExecutor> AttributionAggregator<'a, E> {
    pub fn new(executor: &'a E, config: &'a AttributionConfig) -> Self {
        Self {
            solver: ConsumptionEmissionsSolver::new(),
            executor,
            config,
        }
    }

    pub fn with_solver(mut self, solver: ConsumptionEmissionsSolver) -> Self {
        self.solver = solver;
        self
    }

    #[instrument(level = "info", skip(self, electricity, production), fields(resolution = ?self.config.resolution))]
    pub fn attribute(
        &self,
        electricity: &RegionalTimeSeriesStore,
        production: &TimeSeriesTable,
        pollutant: Pollutant,
    ) -> Result<AttributionResult, AttributionError> {
        let prepared = prepare(electricity, production, pollutant, &self.config.floors)?;
        let inputs = PreparedInputs {
            table: self.config.resolution.aggregate(&prepared.table)?,
            ..prepared
        };
        let table = &inputs.table;
        let n = inputs.regions.len();

        let production_cols: Vec<&[Option<f64>]> = inputs
            .regions
            .iter()
            .map(|r| column(table, &inputs.production_key(r)))
            .collect();
        let generation_cols: Vec<&[Option<f64>]> = inputs
            .regions
            .iter()
            .map(|r| column(table, &inputs.electricity_key(r, Field::NetGeneration)))
            .collect();
        let links: Vec<(usize, usize, &[Option<f64>])> = (0..n)
            .cartesian_product(0..n)
            .filter_map(|(i, j)| {
                let key = ColumnKey::pair(Namespace::Electricity, inputs.regions[i].clone(), inputs.regions[j].clone());
                table.column(&key).map(|values| (i, j, values))
            })
            .collect();

        let solver = self.solver;
        let solutions: Vec<Result<Solution, SolverError>> = self.executor.map(table.len(), |t| {
            let sample = |c: &[Option<f64>]| c.get(t).copied().flatten().unwrap_or(f64::NAN);
            let f: Vec<f64> = production_cols.iter().map(|c| sample(*c)).collect();
            let p: Vec<f64> = generation_cols.iter().map(|c| sample(*c)).collect();
            let mut id = DMatrix::zeros(n, n);
            for (i, j, values) in &links {
                id[(*i, *j)] = sample(*values);
            }
            solver.solve(&f, &p, &id)
        });

        let mut intensity: Vec<Series> = vec![vec![None; table.len()]; n];
        let mut failures = Vec::new();
        let (mut perturbed_timesteps, mut perturbed_total) = (0, 0);
        for (t, outcome) in solutions.into_iter().enumerate() {
            let timestamp = table.index()[t];
            match outcome {
                Ok(solution) => {
                    if !solution.perturbed.is_empty() {
                        perturbed_timesteps += 1;
                        perturbed_total += solution.perturbed.len();
                    }
                    for (i, x) in solution.intensity.into_iter().enumerate() {
                        intensity[i][t] = Some(x);
                    }
                }
                Err(e) if e.is_timestep_local() => {
                    error!(%timestamp, error = %e, "timestep left unsolved");
                    failures.push(TimestepFailure {
                        timestamp,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(%timestamp, error = %e, "attribution aborted");
                    return Err(AttributionError::Solver {
                        timestamp: timestamp.to_rfc3339(),
                        source: e,
                    });
                }
            }
        }

        let quantity = self.quantity_table(&inputs, &intensity)?;
        let emission_factors = self.emission_factor_table(&inputs, &intensity)?;
        info!(
            pollutant = %pollutant,
            timesteps = table.len(),
            regions = n,
            failures = failures.len(),
            perturbed_timesteps,
            "attribution complete"
        );
        Ok(AttributionResult {
            pollutant,
            resolution: self.config.resolution,
            quantity,
            electricity: table.select(|k| k.namespace() == Namespace::Electricity),
            emission_factors,
            failures,
            perturbed_timesteps,
            perturbed_total,
        })
    }

    fn quantity_table(&self, inputs: &PreparedInputs, intensity: &[Series]) -> Result<TimeSeriesTable, AttributionError> {
        let table = &inputs.table;
        let namespace = Namespace::Pollutant(inputs.pollutant);
        let mut out = TimeSeriesTable::new(table.index().to_vec())?;

        for (i, region) in inputs.regions.iter().enumerate() {
            let demand = column(table, &inputs.electricity_key(region, Field::Demand));
            out.insert(
                ColumnKey::region(namespace, region.clone(), Field::Demand),
                product(&intensity[i], demand),
            )?;
            out.insert(
                ColumnKey::region(namespace, region.clone(), Field::NetGeneration),
                column(table, &inputs.production_key(region)).to_vec(),
            )?;
        }

        for (i, region) in inputs.regions.iter().enumerate() {
            let mut total: Series = vec![Some(0.0); table.len()];
            for (j, partner) in inputs.regions.iter().enumerate() {
                let forward = ColumnKey::pair(Namespace::Electricity, region.clone(), partner.clone());
                let backward = ColumnKey::pair(Namespace::Electricity, partner.clone(), region.clone());
                let (Some(flow), true) = (table.column(&forward), table.contains(&backward)) else {
                    continue;
                };
                // imports carry the partner's intensity, exports our own
                let attributed: Series = (0..table.len())
                    .map(|t| {
                        let flow = flow[t]?;
                        Some(flow.min(0.0) * intensity[j][t]? + flow.max(0.0) * intensity[i][t]?)
                    })
                    .collect();
                for (sum, v) in total.iter_mut().zip(&attributed) {
                    *sum = sum.zip(*v).map(|(a, b)| a + b);
                }
                out.insert(forward.with_namespace(namespace), attributed)?;
            }
            // a region without solved intensity has no attributed trade
            for (sum, x) in total.iter_mut().zip(&intensity[i]) {
                if x.is_none() {
                    *sum = None;
                }
            }
            out.insert(ColumnKey::region(namespace, region.clone(), Field::TotalInterchange), total)?;
        }
        Ok(out)
    }

    fn emission_factor_table(&self, inputs: &PreparedInputs, intensity: &[Series]) -> Result<TimeSeriesTable, AttributionError> {
        let table = &inputs.table;
        let namespace = Namespace::Intensity(inputs.pollutant);
        let scale = self.config.emission_factor_scale;
        let mut out = TimeSeriesTable::new(table.index().to_vec())?;

        for (i, region) in inputs.regions.iter().enumerate() {
            out.insert(
                ColumnKey::region(namespace, region.clone(), Field::Demand),
                intensity[i].iter().map(|x| x.map(|x| x * scale)).collect(),
            )?;
            let produced = column(table, &inputs.production_key(region));
            let generated = column(table, &inputs.electricity_key(region, Field::NetGeneration));
            out.insert(
                ColumnKey::region(namespace, region.clone(), Field::NetGeneration),
                produced
                    .iter()
                    .zip(generated)
                    .map(|(f, g)| f.zip(*g).map(|(f, g)| scale * f / g))
                    .collect(),
            )?;
        }
        Ok(out)
    }
}

/// Column slice; prepared inputs always carry the regional columns, anything
/// else reads as missing
fn column<'t>(table: &'t TimeSeriesTable, key: &ColumnKey) -> &'t [Option<f64>] {
    table.column(key).unwrap_or(&[])
}

fn product(a: &[Option<f64>], b: &[Option<f64>]) -> Series {
    (0..a.len())
        .map(|t| Some(a[t]? * b.get(t).copied().flatten()?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Region;
    use crate::solver::SequentialExecutor;
    use chrono::TimeZone;

    fn r(id: &str) -> Region {
        Region::new(id).unwrap()
    }

    fn elec(region: &str, field: Field) -> ColumnKey {
        ColumnKey::region(Namespace::Electricity, r(region), field)
    }

    fn co2(region: &str, field: Field) -> ColumnKey {
        ColumnKey::region(Namespace::Pollutant(Pollutant::Co2), r(region), field)
    }

    /// A exports 30 to B, balanced; A emits 50, B emits 80
    fn inputs(hours: usize) -> (RegionalTimeSeriesStore, TimeSeriesTable) {
        let start = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        let mut table = TimeSeriesTable::hourly(start, hours).unwrap();
        let mut put = |k: ColumnKey, v: f64| table.insert(k, vec![Some(v); hours]).unwrap();
        put(elec("A", Field::Demand), 70.0);
        put(elec("A", Field::NetGeneration), 100.0);
        put(elec("A", Field::TotalInterchange), 30.0);
        put(elec("B", Field::Demand), 130.0);
        put(elec("B", Field::NetGeneration), 100.0);
        put(elec("B", Field::TotalInterchange), -30.0);
        put(ColumnKey::pair(Namespace::Electricity, r("A"), r("B")), 30.0);
        put(ColumnKey::pair(Namespace::Electricity, r("B"), r("A")), -30.0);
        let store = RegionalTimeSeriesStore::new(table, Namespace::Electricity);

        let mut production = TimeSeriesTable::hourly(start, hours).unwrap();
        production.insert(co2("A", Field::NetGeneration), vec![Some(50.0); hours]).unwrap();
        production.insert(co2("B", Field::NetGeneration), vec![Some(80.0); hours]).unwrap();
        (store, production)
    }

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.map_or(false, |a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn test_two_region_attribution() {
        let (store, production) = inputs(2);
        let config = AttributionConfig::default();
        let result = AttributionAggregator::new(&SequentialExecutor, &config)
            .attribute(&store, &production, Pollutant::Co2)
            .unwrap();
        let q = &result.quantity;

        let x_a = 0.5;
        let x_b = 95.0 / 130.0;
        assert!(approx(q.value(&co2("A", Field::Demand), 0), x_a * 70.0));
        assert!(approx(q.value(&co2("B", Field::Demand), 0), x_b * 130.0));
        // A->B export carries A's intensity, B->A import carries A's too
        let ab = ColumnKey::pair(Namespace::Pollutant(Pollutant::Co2), r("A"), r("B"));
        let ba = ColumnKey::pair(Namespace::Pollutant(Pollutant::Co2), r("B"), r("A"));
        assert!(approx(q.value(&ab, 1), 30.0 * x_a));
        assert!(approx(q.value(&ba, 1), -30.0 * x_a));
        assert!(approx(q.value(&co2("B", Field::TotalInterchange), 0), -15.0));

        let ef = &result.emission_factors;
        let ci = |r: &str, f| ColumnKey::region(Namespace::Intensity(Pollutant::Co2), Region::new(r).unwrap(), f);
        assert!(approx(ef.value(&ci("A", Field::Demand), 0), 500.0));
        assert!(approx(ef.value(&ci("B", Field::NetGeneration), 0), 800.0));

        assert!(result.failures.is_empty());
        assert_eq!(result.perturbed_timesteps, 0);
        assert_eq!(result.electricity.column_count(), 8);
    }

    #[test]
    fn test_attributed_balance_holds() {
        // production = consumption + attributed net exports, per region
        let (store, production) = inputs(3);
        let config = AttributionConfig::default();
        let result = AttributionAggregator::new(&SequentialExecutor, &config)
            .attribute(&store, &production, Pollutant::Co2)
            .unwrap();
        let q = &result.quantity;
        for region in ["A", "B"] {
            for t in 0..3 {
                let ng = q.value(&co2(region, Field::NetGeneration), t).unwrap();
                let d = q.value(&co2(region, Field::Demand), t).unwrap();
                let ti = q.value(&co2(region, Field::TotalInterchange), t).unwrap();
                assert!((ng - d - ti).abs() < 1e-9, "{} at {}: {} vs {} + {}", region, t, ng, d, ti);
            }
        }
    }

    #[test]
    fn test_singular_timestep_is_recorded_not_fatal() {
        let (store, production) = inputs(2);
        let config = AttributionConfig::default();
        // a zero limit makes every system "singular"
        let result = AttributionAggregator::new(&SequentialExecutor, &config)
            .with_solver(ConsumptionEmissionsSolver::with_max_condition(0.0))
            .attribute(&store, &production, Pollutant::Co2)
            .unwrap();
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.quantity.value(&co2("A", Field::Demand), 0), None);
        assert_eq!(result.quantity.value(&co2("A", Field::TotalInterchange), 0), None);
        // production passes through untouched
        assert_eq!(result.quantity.value(&co2("A", Field::NetGeneration), 0), Some(50.0));
    }

    /// One day of [`inputs`] where B reports -30 generation at hour 3, which
    /// leaves that hour's system singular
    fn inputs_with_singular_hour() -> (RegionalTimeSeriesStore, TimeSeriesTable) {
        let (mut store, production) = inputs(24);
        store.table_mut().column_mut(&elec("B", Field::NetGeneration)).unwrap()[3] = Some(-30.0);
        (store, production)
    }

    #[test]
    fn test_singular_hour_among_solved_ones() {
        let (store, production) = inputs_with_singular_hour();
        let config = AttributionConfig::default();
        let result = AttributionAggregator::new(&SequentialExecutor, &config)
            .attribute(&store, &production, Pollutant::Co2)
            .unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].timestamp, result.quantity.index()[3]);
        assert_eq!(result.quantity.value(&co2("B", Field::Demand), 3), None);
        assert!(approx(result.quantity.value(&co2("B", Field::Demand), 4), 95.0));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_run_matches_sequential() {
        use crate::solver::{Executor, RayonExecutor};

        let (store, production) = inputs_with_singular_hour();
        let config = AttributionConfig::default();
        let sequential = AttributionAggregator::new(&SequentialExecutor, &config)
            .attribute(&store, &production, Pollutant::Co2)
            .unwrap();
        let executor = Executor::Parallel(RayonExecutor::new(2).unwrap());
        let parallel = AttributionAggregator::new(&executor, &config)
            .attribute(&store, &production, Pollutant::Co2)
            .unwrap();

        assert_eq!(parallel.quantity, sequential.quantity);
        assert_eq!(parallel.electricity, sequential.electricity);
        assert_eq!(parallel.emission_factors, sequential.emission_factors);
        assert_eq!(parallel.failures, sequential.failures);
        assert_eq!(parallel.failures.len(), 1);
        assert_eq!(parallel.perturbed_total, sequential.perturbed_total);
    }

    #[test]
    fn test_yearly_resolution_sums_before_solving() {
        let (store, production) = inputs(4);
        let config = AttributionConfig {
            resolution: Resolution::Yearly,
            ..Default::default()
        };
        let result = AttributionAggregator::new(&SequentialExecutor, &config)
            .attribute(&store, &production, Pollutant::Co2)
            .unwrap();
        assert_eq!(result.quantity.len(), 1);
        // intensity is scale-free, so summed inputs give the hourly answer
        assert!(approx(result.quantity.value(&co2("A", Field::Demand), 0), 0.5 * 280.0));
    }
}
