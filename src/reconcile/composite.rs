//! Fixed compositions of primitives applied to every region

use std::cmp::Ordering;
use tracing::{debug, info};

use super::policy::RuleEffect;
use super::primitives::{Authority, BalanceTarget, Reconciler};
use super::ReconcileError;
use crate::domain::{Field, Region, TimeWindow};

impl Reconciler<'_> {
    /// Regions by descending total demand; ties and missing demand by name
    pub fn regions_by_demand(&self) -> Vec<Region> {
        let store = self.store();
        let mut totals: Vec<(Region, f64)> = store
            .regions()
            .iter()
            .map(|r| {
                let total = store
                    .table()
                    .column(&store.key(r, Field::Demand))
                    .map_or(0.0, |c| c.iter().flatten().sum());
                (r.clone(), total)
            })
            .collect();
        totals.sort_by(|(ra, a), (rb, b)| b.partial_cmp(a).unwrap_or(Ordering::Equal).then_with(|| ra.cmp(rb)));
        totals.into_iter().map(|(r, _)| r).collect()
    }

    /// For every region, largest demand first: each partner is authoritative
    /// for the shared interchange (zero tolerance), D and NG are gap-filled,
    /// then TI is recomputed. Failures are collected per column.
    pub fn standard_fixes(&mut self) -> RuleEffect {
        let mut effect = RuleEffect::default();
        let (pad_limit, weekly_limit) = (self.settings().pad_limit, self.settings().weekly_limit);

        for region in self.regions_by_demand() {
            debug!(region = %region, "standard fixes");
            for partner in self.store().trade_partners(&region) {
                record(
                    &mut effect,
                    self.resolve_direction(&region, &partner, &TimeWindow::all(), 0.0, Authority::Second),
                );
            }
            for field in [Field::Demand, Field::NetGeneration] {
                let key = self.store().key(&region, field);
                match self.fill_gaps(&key, pad_limit, weekly_limit) {
                    Ok(report) => {
                        if report.escalated {
                            effect
                                .warnings
                                .push(format!("{}: {} gaps needed weekly lookups", report.column, report.weekly));
                        }
                        effect.changed += report.filled();
                    }
                    Err(e) => effect.failures.push(e.to_string()),
                }
            }
            record(&mut effect, self.recompute_total_interchange(&region));
        }
        info!(changed = effect.changed, failures = effect.failures.len(), "standard fixes applied");
        effect
    }

    /// Rebalance every region (generation for `adjust_generation`, demand
    /// otherwise), then lift negative D and NG to `floor`
    pub fn final_adjust(&mut self, adjust_generation: &[Region], floor: f64) -> RuleEffect {
        let mut effect = RuleEffect::default();
        for region in self.regions_by_demand() {
            let target = if adjust_generation.contains(&region) {
                BalanceTarget::Generation
            } else {
                BalanceTarget::Demand
            };
            record(&mut effect, self.enforce_balance(&region, target));
            for field in [Field::Demand, Field::NetGeneration] {
                record(&mut effect, self.floor_negatives(&region, field, floor));
            }
        }
        info!(changed = effect.changed, failures = effect.failures.len(), "final adjustment applied");
        effect
    }
}

fn record(effect: &mut RuleEffect, result: Result<usize, ReconcileError>) {
    match result {
        Ok(changed) => effect.changed += changed,
        Err(e) => effect.failures.push(e.to_string()),
    }
}
