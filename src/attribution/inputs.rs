use tracing::{debug, warn};

use super::AttributionError;
use crate::config::FloorConfig;
use crate::domain::{ColumnKey, Field, Namespace, Pollutant, Region, TimeSeriesTable};
use crate::store::RegionalTimeSeriesStore;

/// Joined, gap-free solver inputs for one pollutant
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    pub pollutant: Pollutant,
    pub regions: Vec<Region>,
    /// Electricity D/NG/TI/ID plus `<P>_<r>_NG` production columns
    pub table: TimeSeriesTable,
}

impl PreparedInputs {
    pub fn production_key(&self, region: &Region) -> ColumnKey {
        ColumnKey::region(Namespace::Pollutant(self.pollutant), region.clone(), Field::NetGeneration)
    }

    pub fn electricity_key(&self, region: &Region, field: Field) -> ColumnKey {
        ColumnKey::region(Namespace::Electricity, region.clone(), field)
    }
}

/// Join reconciled electricity with production of `pollutant` and fill the
/// holes the solver cannot take:
/// - production of regions unknown to the electricity store is dropped
/// - regions without production get a floor-valued column
/// - absent D and NG columns are floor-valued, an absent TI column is zero
/// - missing or zero production, D and NG become their floor
/// - missing TI and ID become zero
pub fn prepare(
    electricity: &RegionalTimeSeriesStore,
    production: &TimeSeriesTable,
    pollutant: Pollutant,
    floors: &FloorConfig,
) -> Result<PreparedInputs, AttributionError> {
    if electricity.namespace() != Namespace::Electricity {
        return Err(AttributionError::WrongNamespace {
            expected: Namespace::Electricity,
            found: electricity.namespace(),
        });
    }
    let regions = electricity.regions().to_vec();
    if regions.is_empty() {
        return Err(AttributionError::NoRegions);
    }

    let namespace = Namespace::Pollutant(pollutant);
    let produced = production.select(|k| {
        if k.namespace() != namespace || k.field() != Field::NetGeneration {
            return false;
        }
        let known = electricity.has_region(k.region_id());
        if !known {
            warn!(column = %k, "dropping production of a region without electricity data");
        }
        known
    });
    let mut table = electricity
        .table()
        .select(|k| k.namespace() == Namespace::Electricity)
        .inner_join(&produced)?;
    if table.is_empty() {
        warn!(pollutant = %pollutant, "electricity and production share no timestamps");
    }

    let rows = table.len();
    let production_floor = floors.for_namespace(namespace);
    for region in &regions {
        let key = ColumnKey::region(namespace, region.clone(), Field::NetGeneration);
        if !table.contains(&key) {
            debug!(column = %key, "no production reported, using floor");
            table.insert(key, vec![Some(production_floor); rows])?;
        }
        for field in Field::REGIONAL {
            let key = electricity.key(region, field);
            if table.contains(&key) {
                continue;
            }
            let fill = match field {
                Field::TotalInterchange => 0.0,
                _ => floors.electricity,
            };
            warn!(column = %key, fill, "electricity column missing, filling");
            table.insert(key, vec![Some(fill); rows])?;
        }
    }

    let keys: Vec<ColumnKey> = table.keys().cloned().collect();
    for key in keys {
        let fill = match (key.namespace(), key.field()) {
            (Namespace::Electricity, Field::Demand | Field::NetGeneration) => Fill::Floor(floors.electricity),
            (Namespace::Electricity, _) => Fill::Zero,
            (_, _) => Fill::Floor(production_floor),
        };
        if let Some(values) = table.column_mut(&key) {
            fill.apply(values);
        }
    }

    Ok(PreparedInputs {
        pollutant,
        regions,
        table,
    })
}

enum Fill {
    /// Missing or zero samples take the floor
    Floor(f64),
    /// Missing samples become zero
    Zero,
}

impl Fill {
    fn apply(&self, values: &mut [Option<f64>]) {
        for v in values.iter_mut() {
            match (self, *v) {
                (Fill::Floor(floor), None) => *v = Some(*floor),
                (Fill::Floor(floor), Some(x)) if x == 0.0 => *v = Some(*floor),
                (Fill::Zero, None) => *v = Some(0.0),
                _ => {}
            }
        }
    }
}
