//! Declarative reconciliation policy.
//!
//! Historical per-region corrections are data, not code: a policy file lists
//! rules that the [`PolicyRunner`] applies in order through the generic
//! [`Reconciler`] primitives.
//!
//! ```toml
//! [[rules]]
//! rule = "resolve_direction"
//! authoritative = "AZPS"
//! other = "TEPC"
//! window = { start = "2016-01-01T00:00:00Z", end = "2016-05-01T00:00:00Z" }
//!
//! [[rules]]
//! rule = "standard_fixes"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use strum::IntoStaticStr;
use tracing::{info, warn};

use super::primitives::{Authority, BalanceTarget, Bounds, Reconciler};
use super::ReconcileError;
use crate::config::ReconcileConfig;
use crate::domain::{ColumnKey, Field, Region, TimeWindow};
use crate::store::RegionalTimeSeriesStore;

/// One reconciliation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "rule", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PolicyRule {
    /// `other`'s outgoing interchange is overwritten from `authoritative`
    ResolveDirection {
        authoritative: Region,
        other: Region,
        #[serde(default)]
        window: TimeWindow,
        /// Defaults to the configured tolerance
        tolerance: Option<f64>,
    },
    /// Fill only the missing samples of `region`'s outgoing interchange from
    /// what `partner` reported
    FillFromPartner {
        region: Region,
        partner: Region,
        #[serde(default)]
        window: TimeWindow,
    },
    /// Rejected samples become `replace_with`, or missing when it is absent
    RejectOutliers {
        column: ColumnKey,
        #[serde(default)]
        window: TimeWindow,
        lower: Option<f64>,
        upper: Option<f64>,
        replace_with: Option<f64>,
    },
    FillGaps {
        column: ColumnKey,
        pad_limit: Option<usize>,
        weekly_limit: Option<usize>,
    },
    /// Forward-fill only; remaining gaps are left for later rules
    Pad {
        column: ColumnKey,
        #[serde(default)]
        window: TimeWindow,
        limit: usize,
    },
    SetConstant {
        column: ColumnKey,
        #[serde(default)]
        window: TimeWindow,
        value: f64,
    },
    RecomputeTotalInterchange {
        region: Region,
    },
    EnforceBalance {
        region: Region,
        adjust: BalanceTarget,
    },
    FloorNegatives {
        region: Region,
        field: Field,
        floor: Option<f64>,
    },
    ClampNegatives {
        field: Field,
        hard_limit: f64,
    },
    ShiftSeries {
        region: Region,
        #[serde(default)]
        window: TimeWindow,
        lead_hours: i64,
    },
    DistributeCorrection {
        region: Region,
        field: Field,
        target_total: f64,
    },
    /// Partner-authoritative interchange, gap filling and TI recomputation for
    /// every region
    StandardFixes,
    /// Balance every region and floor remaining negatives
    FinalAdjust {
        #[serde(default)]
        adjust_generation: Vec<Region>,
        floor: Option<f64>,
    },
}

impl PolicyRule {
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Short human-readable target for reports
    pub fn describe(&self) -> String {
        match self {
            PolicyRule::ResolveDirection { authoritative, other, .. } => {
                format!("{} ({} over {})", self.kind(), authoritative, other)
            }
            PolicyRule::FillFromPartner { region, partner, .. } => {
                format!("{} ({} from {})", self.kind(), region, partner)
            }
            PolicyRule::RejectOutliers { column, .. }
            | PolicyRule::FillGaps { column, .. }
            | PolicyRule::Pad { column, .. }
            | PolicyRule::SetConstant { column, .. } => {
                format!("{} ({})", self.kind(), column)
            }
            PolicyRule::RecomputeTotalInterchange { region }
            | PolicyRule::EnforceBalance { region, .. }
            | PolicyRule::ShiftSeries { region, .. } => format!("{} ({})", self.kind(), region),
            PolicyRule::FloorNegatives { region, field, .. }
            | PolicyRule::DistributeCorrection { region, field, .. } => {
                format!("{} ({} {})", self.kind(), region, field)
            }
            PolicyRule::ClampNegatives { field, .. } => format!("{} ({})", self.kind(), field),
            PolicyRule::StandardFixes | PolicyRule::FinalAdjust { .. } => self.kind().to_string(),
        }
    }

    /// Apply this rule through `rec`
    pub fn apply(&self, rec: &mut Reconciler<'_>) -> Result<RuleEffect, ReconcileError> {
        let settings = rec.settings().clone();
        let effect = match self {
            PolicyRule::ResolveDirection {
                authoritative,
                other,
                window,
                tolerance,
            } => RuleEffect::changed(rec.resolve_direction(
                authoritative,
                other,
                window,
                tolerance.unwrap_or(settings.tolerance),
                Authority::First,
            )?),
            PolicyRule::FillFromPartner { region, partner, window } => RuleEffect::changed(
                rec.resolve_direction(region, partner, window, f64::INFINITY, Authority::Second)?,
            ),
            PolicyRule::RejectOutliers {
                column,
                window,
                lower,
                upper,
                replace_with,
            } => {
                let bounds = (lower.is_some() || upper.is_some()).then_some(Bounds {
                    lower: *lower,
                    upper: *upper,
                });
                let report = rec.reject_outliers(column, window, bounds, *replace_with)?;
                let mut effect = RuleEffect::changed(report.removed);
                if report.escalated {
                    effect
                        .warnings
                        .push(format!("{}: {} outliers removed", report.column, report.removed));
                }
                effect
            }
            PolicyRule::FillGaps {
                column,
                pad_limit,
                weekly_limit,
            } => {
                let report = rec.fill_gaps(
                    column,
                    pad_limit.unwrap_or(settings.pad_limit),
                    weekly_limit.unwrap_or(settings.weekly_limit),
                )?;
                let mut effect = RuleEffect::changed(report.filled());
                if report.escalated {
                    effect
                        .warnings
                        .push(format!("{}: {} gaps needed weekly lookups", report.column, report.weekly));
                }
                effect
            }
            PolicyRule::Pad { column, window, limit } => RuleEffect::changed(rec.pad(column, window, *limit)?),
            PolicyRule::SetConstant { column, window, value } => {
                RuleEffect::changed(rec.set_constant(column, window, *value)?)
            }
            PolicyRule::RecomputeTotalInterchange { region } => {
                RuleEffect::changed(rec.recompute_total_interchange(region)?)
            }
            PolicyRule::EnforceBalance { region, adjust } => RuleEffect::changed(rec.enforce_balance(region, *adjust)?),
            PolicyRule::FloorNegatives { region, field, floor } => RuleEffect::changed(rec.floor_negatives(
                region,
                *field,
                floor.unwrap_or(settings.balance_floor),
            )?),
            PolicyRule::ClampNegatives { field, hard_limit } => {
                let report = rec.clamp_negatives(*field, *hard_limit)?;
                RuleEffect::changed(report.to_missing + report.to_zero)
            }
            PolicyRule::ShiftSeries {
                region,
                window,
                lead_hours,
            } => {
                let columns = rec.shift_series(region, window, *lead_hours)?;
                RuleEffect::changed(columns * rec.store().table().window_range(window).len())
            }
            PolicyRule::DistributeCorrection {
                region,
                field,
                target_total,
            } => {
                rec.distribute_correction(region, *field, *target_total)?;
                RuleEffect::changed(rec.store().table().len())
            }
            PolicyRule::StandardFixes => rec.standard_fixes(),
            PolicyRule::FinalAdjust { adjust_generation, floor } => {
                rec.final_adjust(adjust_generation, floor.unwrap_or(settings.balance_floor))
            }
        };
        Ok(effect)
    }
}

/// What a rule did to the store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleEffect {
    pub changed: usize,
    /// Soft-threshold escalations
    pub warnings: Vec<String>,
    /// Non-fatal failures inside composite rules
    pub failures: Vec<String>,
}

impl RuleEffect {
    pub fn changed(changed: usize) -> Self {
        Self {
            changed,
            ..Default::default()
        }
    }
}

/// Ordered list of rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    /// The two compositions every run ends with when no policy file is given
    pub fn standard() -> Self {
        Self {
            rules: vec![
                PolicyRule::StandardFixes,
                PolicyRule::FinalAdjust {
                    adjust_generation: Vec::new(),
                    floor: None,
                },
            ],
        }
    }

    /// Load a TOML or YAML policy, chosen by file extension
    pub fn from_path(path: &Path) -> Result<Self, ReconcileError> {
        let policy_err = |message: String| ReconcileError::Policy {
            path: path.to_path_buf(),
            message,
        };
        let body = std::fs::read_to_string(path).map_err(|e| policy_err(e.to_string()))?;
        let policy: Policy = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&body).map_err(|e| policy_err(e.to_string()))?,
            _ => toml::from_str(&body).map_err(|e| policy_err(e.to_string()))?,
        };
        info!(path = %path.display(), rules = policy.rules.len(), "policy loaded");
        Ok(policy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleOutcome {
    pub index: usize,
    pub rule: String,
    pub changed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub index: usize,
    pub rule: String,
    pub message: String,
}

/// Aggregated result of a policy run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub outcomes: Vec<RuleOutcome>,
    pub warnings: Vec<String>,
    pub failures: Vec<RuleFailure>,
}

impl ReconciliationReport {
    pub fn total_changed(&self) -> usize {
        self.outcomes.iter().map(|o| o.changed).sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Applies a [`Policy`] to a store; rule failures are recorded, never fatal
pub struct PolicyRunner<'a> {
    settings: &'a ReconcileConfig,
}

impl<'a> PolicyRunner<'a> {
    pub fn new(settings: &'a ReconcileConfig) -> Self {
        Self { settings }
    }

    pub fn run(&self, store: &mut RegionalTimeSeriesStore, policy: &Policy) -> ReconciliationReport {
        let mut rec = Reconciler::new(store, self.settings);
        let mut report = ReconciliationReport::default();

        for (index, rule) in policy.rules.iter().enumerate() {
            let label = rule.describe();
            match rule.apply(&mut rec) {
                Ok(effect) => {
                    report.outcomes.push(RuleOutcome {
                        index,
                        rule: label.clone(),
                        changed: effect.changed,
                    });
                    report.warnings.extend(effect.warnings);
                    report.failures.extend(effect.failures.into_iter().map(|message| RuleFailure {
                        index,
                        rule: label.clone(),
                        message,
                    }));
                }
                Err(e) => {
                    warn!(rule = %label, error = %e, "reconciliation rule failed");
                    report.failures.push(RuleFailure {
                        index,
                        rule: label,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            rules = policy.rules.len(),
            changed = report.total_changed(),
            warnings = report.warnings.len(),
            failures = report.failures.len(),
            "policy applied"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Namespace, TimeSeriesTable};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_toml_policy() {
        let body = r#"
            [[rules]]
            rule = "resolve_direction"
            authoritative = "AZPS"
            other = "TEPC"
            window = { start = "2016-01-01T00:00:00Z" }

            [[rules]]
            rule = "fill_gaps"
            column = "EBA.AZPS-ALL.D.H"
            pad_limit = 1

            [[rules]]
            rule = "final_adjust"
            adjust_generation = ["TEPC"]
        "#;
        let policy: Policy = toml::from_str(body).unwrap();
        assert_eq!(policy.rules.len(), 3);
        match &policy.rules[0] {
            PolicyRule::ResolveDirection {
                authoritative,
                window,
                tolerance,
                ..
            } => {
                assert_eq!(authoritative.as_str(), "AZPS");
                assert!(window.start.is_some() && window.end.is_none());
                assert!(tolerance.is_none());
            }
            other => panic!("unexpected rule {:?}", other),
        }
        assert_eq!(
            policy.rules[1],
            PolicyRule::FillGaps {
                column: ColumnKey::region(Namespace::Electricity, Region::new("AZPS").unwrap(), Field::Demand),
                pad_limit: Some(1),
                weekly_limit: None,
            }
        );
        assert_eq!(policy.rules[2].kind(), "final_adjust");
    }

    #[test]
    fn test_yaml_policy_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(
            &path,
            "rules:\n  - rule: clamp_negatives\n    field: D\n    hard_limit: 100\n  - rule: standard_fixes\n",
        )
        .unwrap();
        let policy = Policy::from_path(&path).unwrap();
        assert_eq!(
            policy.rules,
            vec![
                PolicyRule::ClampNegatives {
                    field: Field::Demand,
                    hard_limit: 100.0
                },
                PolicyRule::StandardFixes
            ]
        );
    }

    #[test]
    fn test_shipped_policy_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/policy.toml");
        let policy = Policy::from_path(&path).unwrap();
        assert!(policy.rules.iter().any(|r| r.kind() == "set_constant"));
        assert_eq!(policy.rules.last().map(PolicyRule::kind), Some("final_adjust"));
    }

    #[test]
    fn test_malformed_policy_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "[[rules]]\nrule = \"no_such_rule\"\n").unwrap();
        assert!(matches!(Policy::from_path(&path), Err(ReconcileError::Policy { .. })));
    }

    #[test]
    fn test_pad_then_set_constant_rules() {
        let start = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        let a = Region::new("A").unwrap();
        let b = Region::new("B").unwrap();
        let ab = ColumnKey::pair(Namespace::Electricity, a.clone(), b.clone());
        let ba = ColumnKey::pair(Namespace::Electricity, b, a);
        let mut table = TimeSeriesTable::hourly(start, 8).unwrap();
        let mut flow = vec![Some(30.0); 8];
        flow[2..6].fill(None);
        table.insert(ab.clone(), flow).unwrap();
        table.insert(ba.clone(), vec![Some(-30.0); 8]).unwrap();
        let mut store = RegionalTimeSeriesStore::new(table, Namespace::Electricity);

        let body = r#"
            [[rules]]
            rule = "pad"
            column = "EBA.A-B.ID.H"
            limit = 1

            [[rules]]
            rule = "set_constant"
            column = "EBA.B-A.ID.H"
            window = { start = "2016-01-01T06:00:00Z" }
            value = 0.0
        "#;
        let policy: Policy = toml::from_str(body).unwrap();
        let settings = ReconcileConfig::default();
        let report = PolicyRunner::new(&settings).run(&mut store, &policy);

        assert!(!report.has_failures());
        assert_eq!(report.outcomes[0].rule, "pad (EBA.A-B.ID.H)");
        assert_eq!(report.outcomes[0].changed, 1);
        assert_eq!(report.outcomes[1].changed, 2);
        let table = store.table();
        assert_eq!(
            table.column(&ab).unwrap(),
            &[Some(30.0), Some(30.0), Some(30.0), None, None, None, Some(30.0), Some(30.0)]
        );
        assert_eq!(table.value(&ba, 5), Some(-30.0));
        assert_eq!(table.value(&ba, 6), Some(0.0));
    }

    #[test]
    fn test_outlier_rule_replacement() {
        let body = r#"
            rule = "reject_outliers"
            column = "EBA.A-B.ID.H"
            upper = 1000.0
            replace_with = 0.0
        "#;
        let rule: PolicyRule = toml::from_str(body).unwrap();
        match rule {
            PolicyRule::RejectOutliers {
                lower, upper, replace_with, ..
            } => {
                assert_eq!((lower, upper, replace_with), (None, Some(1000.0), Some(0.0)));
            }
            other => panic!("unexpected rule {:?}", other),
        }
    }

    #[test]
    fn test_describe() {
        let rule = PolicyRule::ResolveDirection {
            authoritative: Region::new("A").unwrap(),
            other: Region::new("B").unwrap(),
            window: TimeWindow::all(),
            tolerance: None,
        };
        assert_eq!(rule.describe(), "resolve_direction (A over B)");
        assert_eq!(PolicyRule::StandardFixes.describe(), "standard_fixes");
    }
}
