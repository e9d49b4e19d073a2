use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DomainError, Series, TimeSeriesTable};

/// Temporal resolution of an attribution run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[default]
    Hourly,
    Monthly,
    Yearly,
}

impl Resolution {
    /// Suffix used in output stage names
    pub fn suffix(&self) -> &'static str {
        match self {
            Resolution::Hourly => "H",
            Resolution::Monthly => "M",
            Resolution::Yearly => "Y",
        }
    }

    /// First hour of the period containing `ts`
    pub fn period_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let day = match self {
            Resolution::Hourly => return ts,
            Resolution::Monthly => NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1),
            Resolution::Yearly => NaiveDate::from_ymd_opt(ts.year(), 1, 1),
        };
        day.and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .unwrap_or(ts)
    }

    /// Sum every column per period. A period with no present sample stays
    /// missing.
    pub fn aggregate(&self, table: &TimeSeriesTable) -> Result<TimeSeriesTable, DomainError> {
        if *self == Resolution::Hourly {
            return Ok(table.clone());
        }

        // the index is sorted, so periods are contiguous runs
        let mut starts: Vec<DateTime<Utc>> = Vec::new();
        let mut groups: Vec<usize> = Vec::with_capacity(table.len());
        for ts in table.index() {
            let period = self.period_start(*ts);
            if starts.last() != Some(&period) {
                starts.push(period);
            }
            groups.push(starts.len() - 1);
        }

        let mut aggregated = TimeSeriesTable::new(starts)?;
        let periods = aggregated.len();
        for (key, values) in table.columns() {
            let mut sums: Series = vec![None; periods];
            for (value, group) in values.iter().zip(&groups) {
                if let Some(v) = value {
                    *sums[*group].get_or_insert(0.0) += v;
                }
            }
            aggregated.insert(key.clone(), sums)?;
        }
        Ok(aggregated)
    }
}
