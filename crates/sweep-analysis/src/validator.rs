//! Post-hoc health scoring of one finished run.

use crate::snapshot::Snapshot;
use serde::Serialize;
use sweep_core::plan::ValidationCriteria;

/// Denominator floor for relative change against near-zero initial values.
const RELATIVE_FLOOR: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Valid,
    Warning,
    Incomplete,
    /// Died immediately; normal at the extreme corners of a sweep.
    FailedAsExpected,
}

impl HealthStatus {
    pub const ALL: [HealthStatus; 4] = [
        HealthStatus::Valid,
        HealthStatus::Warning,
        HealthStatus::Incomplete,
        HealthStatus::FailedAsExpected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Valid => "VALID",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Incomplete => "INCOMPLETE",
            HealthStatus::FailedAsExpected => "FAILED_AS_EXPECTED",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, HealthStatus::Valid | HealthStatus::Warning)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub n_snapshots: usize,
    pub time_coverage: f64,
    pub max_evolution: f64,
    pub has_nan: bool,
    pub has_inf: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationHealth {
    pub status: HealthStatus,
    pub metrics: HealthMetrics,
    pub completeness: f64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SimulationValidator {
    criteria: ValidationCriteria,
}

impl SimulationValidator {
    pub fn new(criteria: ValidationCriteria) -> Self {
        SimulationValidator { criteria }
    }

    pub fn criteria(&self) -> &ValidationCriteria {
        &self.criteria
    }

    fn time_coverage(&self, snapshots: &[Snapshot], expected_end: Option<f64>) -> f64 {
        let count_based = (snapshots.len() as f64 / self.criteria.min_snapshots as f64).min(1.0);
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return 0.0;
        };
        match expected_end {
            Some(end) if end > first.time => (last.time - first.time) / (end - first.time),
            _ => count_based,
        }
    }

    fn tracked_fields<'a>(&'a self, first: &'a Snapshot, last: &'a Snapshot) -> Vec<&'a str> {
        if self.criteria.tracked_fields.is_empty() {
            first
                .fields
                .keys()
                .filter(|k| last.fields.contains_key(*k))
                .map(|k| k.as_str())
                .collect()
        } else {
            self.criteria.tracked_fields.iter().map(|s| s.as_str()).collect()
        }
    }

    /// Largest element-wise relative change between the first and last
    /// snapshot over the tracked fields. A field whose largest change is not
    /// finite is skipped.
    fn max_evolution(&self, snapshots: &[Snapshot]) -> f64 {
        if snapshots.len() < 2 {
            return 0.0;
        }
        let (first, last) = (&snapshots[0], &snapshots[snapshots.len() - 1]);
        let mut max_change: f64 = 0.0;
        for field in self.tracked_fields(first, last) {
            let (Some(initial), Some(fin)) = (first.fields.get(field), last.fields.get(field)) else {
                continue;
            };
            let changes: Vec<f64> = initial
                .iter()
                .zip(fin)
                .map(|(a, b)| {
                    let denom = if a.abs() < RELATIVE_FLOOR { RELATIVE_FLOOR } else { *a };
                    ((b - a) / denom).abs()
                })
                .collect();
            if changes.iter().any(|c| c.is_nan()) {
                continue;
            }
            let field_max = changes.into_iter().fold(0.0, f64::max);
            if field_max.is_finite() {
                max_change = max_change.max(field_max);
            }
        }
        max_change
    }

    fn completeness(&self, metrics: &HealthMetrics) -> f64 {
        if metrics.has_nan || metrics.has_inf {
            return 0.0;
        }
        let c = &self.criteria;
        let count = (metrics.n_snapshots as f64 / (2.0 * c.min_snapshots as f64)).min(1.0);
        let time = (metrics.time_coverage / c.min_time_coverage).clamp(0.0, 1.0);
        let evo = metrics.max_evolution;
        let evolution = if evo < c.min_evolution {
            evo / c.min_evolution
        } else if evo > c.max_evolution {
            1.0 - (evo - c.max_evolution) / c.max_evolution
        } else {
            1.0
        }
        .clamp(0.0, 1.0);
        (0.5 * time + 0.3 * count + 0.2 * evolution).clamp(0.0, 1.0)
    }

    pub fn validate(&self, snapshots: &[Snapshot], expected_end_time: Option<f64>) -> SimulationHealth {
        let c = &self.criteria;
        let expected_end_time = expected_end_time.or(c.expected_end_time);
        let metrics = HealthMetrics {
            n_snapshots: snapshots.len(),
            time_coverage: self.time_coverage(snapshots, expected_end_time),
            max_evolution: self.max_evolution(snapshots),
            has_nan: snapshots.iter().any(Snapshot::has_nan),
            has_inf: snapshots.iter().any(Snapshot::has_inf),
        };

        let enough_snapshots = metrics.n_snapshots >= c.min_snapshots;
        let enough_coverage = metrics.time_coverage >= c.min_time_coverage;
        let too_little = metrics.max_evolution < c.min_evolution;
        let too_much = metrics.max_evolution > c.max_evolution;
        let stable = !(metrics.has_nan || metrics.has_inf);

        let mut issues = Vec::new();
        if snapshots.is_empty() {
            issues.push("no snapshots found".to_string());
        }
        if !enough_snapshots {
            issues.push(format!(
                "only {} snapshot(s) (need >= {})",
                metrics.n_snapshots, c.min_snapshots
            ));
        }
        if !enough_coverage {
            issues.push(format!(
                "time coverage {:.1}% (need >= {:.1}%)",
                metrics.time_coverage * 100.0,
                c.min_time_coverage * 100.0
            ));
        }
        if too_little {
            issues.push(format!(
                "insufficient evolution ({:.2e} < {:.2e})",
                metrics.max_evolution, c.min_evolution
            ));
        } else if too_much {
            issues.push(format!(
                "evolution {:.2e} exceeds {:.2e}; run blew up",
                metrics.max_evolution, c.max_evolution
            ));
        }
        if metrics.has_nan {
            issues.push("NaN values detected".to_string());
        }
        if metrics.has_inf {
            issues.push("Inf values detected".to_string());
        }

        let status = if metrics.n_snapshots <= 1 && too_little {
            issues.push("run failed immediately; expected at extreme parameter values".to_string());
            HealthStatus::FailedAsExpected
        } else if !stable {
            issues.push("numerical instability".to_string());
            HealthStatus::Incomplete
        } else if !enough_snapshots {
            issues.push(format!(
                "run stopped unexpectedly after {} snapshot(s)",
                metrics.n_snapshots
            ));
            HealthStatus::Incomplete
        } else if !enough_coverage || too_little || too_much {
            HealthStatus::Warning
        } else {
            HealthStatus::Valid
        };

        let completeness = self.completeness(&metrics);
        SimulationHealth {
            status,
            metrics,
            completeness,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snap(time: f64, rho: Vec<f64>) -> Snapshot {
        let mut fields = BTreeMap::new();
        fields.insert("rho".to_string(), rho);
        Snapshot { time, fields }
    }

    fn evolving_run(n: usize, growth: f64) -> Vec<Snapshot> {
        (0..n)
            .map(|i| {
                let f = i as f64 / (n - 1) as f64;
                snap(f, vec![1.0 + growth * f, 2.0])
            })
            .collect()
    }

    #[test]
    fn single_static_snapshot_failed_as_expected() {
        let health = SimulationValidator::default().validate(&[snap(0.0, vec![1.0])], None);
        assert_eq!(health.status, HealthStatus::FailedAsExpected);
        assert_eq!(health.metrics.max_evolution, 0.0);
        assert!(health.completeness < 0.5);
    }

    #[test]
    fn empty_run_is_failed_as_expected_with_issue() {
        let health = SimulationValidator::default().validate(&[], Some(1.0));
        assert_eq!(health.status, HealthStatus::FailedAsExpected);
        assert_eq!(health.metrics.time_coverage, 0.0);
        assert!(health.issues.iter().any(|i| i == "no snapshots found"));
    }

    #[test]
    fn healthy_run_is_valid_with_full_completeness() {
        let health = SimulationValidator::default().validate(&evolving_run(50, 0.5), Some(1.0));
        assert_eq!(health.status, HealthStatus::Valid);
        assert!((health.metrics.max_evolution - 0.5).abs() < 1e-12);
        assert!((health.metrics.time_coverage - 1.0).abs() < 1e-12);
        assert!((health.completeness - 1.0).abs() < 1e-9);
        assert!(health.issues.is_empty());
    }

    #[test]
    fn nan_anywhere_makes_the_run_incomplete_with_zero_weight() {
        let mut run = evolving_run(20, 0.5);
        run[7].fields.insert("aux".to_string(), vec![f64::NAN]);
        let health = SimulationValidator::default().validate(&run, None);
        assert_eq!(health.status, HealthStatus::Incomplete);
        assert!(health.metrics.has_nan);
        assert_eq!(health.completeness, 0.0);
    }

    #[test]
    fn too_few_snapshots_is_incomplete() {
        let health = SimulationValidator::default().validate(&evolving_run(4, 0.5), None);
        assert_eq!(health.status, HealthStatus::Incomplete);
        assert!((health.metrics.time_coverage - 0.4).abs() < 1e-12);
    }

    #[test]
    fn short_coverage_or_blow_up_is_a_warning() {
        let validator = SimulationValidator::default();
        let mut run = evolving_run(20, 0.5);
        for s in &mut run {
            s.time *= 0.5;
        }
        let health = validator.validate(&run, Some(1.0));
        assert_eq!(health.status, HealthStatus::Warning);
        assert!((health.metrics.time_coverage - 0.5).abs() < 1e-12);

        let health = validator.validate(&evolving_run(20, 150.0), Some(1.0));
        assert_eq!(health.status, HealthStatus::Warning);
        // evolution factor 1 - (150 - 100) / 100 = 0.5
        assert!((health.completeness - 0.9).abs() < 1e-9);
    }

    #[test]
    fn near_zero_initial_values_are_floored_and_non_finite_fields_skipped() {
        let mut first = snap(0.0, vec![0.0]);
        let mut last = snap(1.0, vec![1e-12]);
        first.fields.insert("ux".to_string(), vec![1.0]);
        last.fields.insert("ux".to_string(), vec![f64::INFINITY]);
        let validator = SimulationValidator::new(ValidationCriteria {
            tracked_fields: Vec::new(),
            ..ValidationCriteria::default()
        });
        let health = validator.validate(&[first, last], None);
        assert!((health.metrics.max_evolution - 0.01).abs() < 1e-9);
        assert!(health.metrics.has_inf);
    }
}
