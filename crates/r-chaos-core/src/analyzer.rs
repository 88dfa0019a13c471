//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Behaviour analysis, recovery validation, and regression detection."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::experiment::{ExperimentRecord, MetricsSnapshot};

/// Error-rate increase (percentage points) above which resilience is poor.
pub const POOR_ERROR_RATE_INCREASE: f64 = 50.0;
/// Response-time degradation (percent) above which resilience is moderate.
pub const MODERATE_DEGRADATION_PERCENT: f64 = 200.0;
/// Post-recovery response time may exceed the pre-experiment value by this fraction.
pub const RECOVERY_RESPONSE_TOLERANCE: f64 = 0.5;
/// Post-recovery error rate may exceed the pre-experiment value by this many points.
pub const RECOVERY_ERROR_TOLERANCE: f64 = 10.0;

/// Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResilienceLevel {
    Good,
    Moderate,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorAnalysis {
    pub resilience_level: ResilienceLevel,
    /// Peak observed error rate minus baseline, in percentage points.
    pub error_rate_increase: f64,
    pub peak_error_rate: f64,
    /// Mean observed response time relative to baseline, in percent.
    /// `None` when either side has no measurable response time.
    #[serde(default)]
    pub degradation_percent: Option<f64>,
    pub observation_count: usize,
    /// The fault was simulated; excluded from regression comparisons.
    pub dry_run: bool,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryValidation {
    pub recovered: bool,
    /// Response time could not be compared; an operator has to judge.
    pub undetermined: bool,
    #[serde(default)]
    pub response_time_delta_ms: Option<f64>,
    pub error_rate_delta: f64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionReport {
    pub regressed: bool,
    pub compared_against: usize,
    #[serde(default)]
    pub historical_error_rate_increase: Option<f64>,
    #[serde(default)]
    pub historical_degradation_percent: Option<f64>,
    pub findings: Vec<String>,
}

/// Pure analysis over snapshots and past records.
#[derive(Debug, Clone)]
pub struct RegressionAnalyzer {
    tolerance: f64,
}

impl Default for RegressionAnalyzer {
    fn default() -> Self {
        Self::new(25.0)
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

impl RegressionAnalyzer {
    /// `tolerance` is in percentage points for both error rate and degradation.
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    pub fn analyze_behavior(
        &self,
        observations: &[MetricsSnapshot],
        baseline: &MetricsSnapshot,
        dry_run: bool,
    ) -> BehaviorAnalysis {
        let peak_error_rate = observations
            .iter()
            .map(|o| o.error_rate)
            .fold(baseline.error_rate, f64::max);
        let error_rate_increase = (peak_error_rate - baseline.error_rate).max(0.0);

        let observed_response = mean(observations.iter().filter_map(|o| o.response_time_ms));
        let degradation_percent = match (baseline.response_time_ms, observed_response) {
            (Some(base), Some(observed)) if base > 0.0 => Some((observed - base) / base * 100.0),
            _ => None,
        };

        let resilience_level = if error_rate_increase > POOR_ERROR_RATE_INCREASE {
            ResilienceLevel::Poor
        } else if degradation_percent.is_some_and(|d| d > MODERATE_DEGRADATION_PERCENT) {
            ResilienceLevel::Moderate
        } else {
            ResilienceLevel::Good
        };

        let mut recommendations = Vec::new();
        match resilience_level {
            ResilienceLevel::Poor => recommendations.push(format!(
                "error rate rose {error_rate_increase:.1} points under fault; add retries, \
                 circuit breaking, or fallbacks on the affected path"
            )),
            ResilienceLevel::Moderate => recommendations.push(format!(
                "response time degraded {:.0}%; review timeouts, caching, and connection pooling",
                degradation_percent.unwrap_or_default()
            )),
            ResilienceLevel::Good => {
                recommendations.push("system absorbed the fault within thresholds".to_owned())
            }
        }
        if observations.is_empty() {
            recommendations
                .push("no observations were captured; lengthen the experiment duration".to_owned());
        } else if degradation_percent.is_none() {
            recommendations.push(
                "response time was undetermined during the fault; verify probe endpoints".to_owned(),
            );
        }
        if dry_run {
            recommendations.push(
                "fault was simulated on this host; result excluded from regression tracking"
                    .to_owned(),
            );
        }

        BehaviorAnalysis {
            resilience_level,
            error_rate_increase,
            peak_error_rate,
            degradation_percent,
            observation_count: observations.len(),
            dry_run,
            recommendations,
        }
    }

    /// Compare post-recovery health against the pre-experiment snapshot.
    ///
    /// A missing response time on either side is never treated as recovered.
    pub fn validate_recovery(&self, pre: &MetricsSnapshot, post: &MetricsSnapshot) -> RecoveryValidation {
        let mut issues = Vec::new();
        let error_rate_delta = post.error_rate - pre.error_rate;

        let (response_ok, undetermined, response_time_delta_ms) =
            match (pre.response_time_ms, post.response_time_ms) {
                (Some(before), Some(after)) => {
                    let delta = after - before;
                    let ok = delta <= 0.0 || delta < RECOVERY_RESPONSE_TOLERANCE * before;
                    if !ok {
                        issues.push(format!(
                            "response time {after:.1}ms is {delta:.1}ms above pre-experiment {before:.1}ms"
                        ));
                    }
                    (ok, false, Some(delta))
                }
                (before, after) => {
                    issues.push(format!(
                        "response time undetermined (pre: {}, post: {}); operator review required",
                        describe(before),
                        describe(after)
                    ));
                    (false, true, None)
                }
            };

        let errors_ok = error_rate_delta < RECOVERY_ERROR_TOLERANCE;
        if !errors_ok {
            issues.push(format!(
                "error rate {:.1}% is {error_rate_delta:.1} points above pre-experiment {:.1}%",
                post.error_rate, pre.error_rate
            ));
        }

        RecoveryValidation {
            recovered: response_ok && errors_ok,
            undetermined,
            response_time_delta_ms,
            error_rate_delta,
            issues,
        }
    }

    /// Compare `current` with earlier non-simulated runs of the same type.
    ///
    /// Returns `None` for simulated runs and runs without analysis.
    pub fn detect_regression(
        &self,
        current: &ExperimentRecord,
        history: &[ExperimentRecord],
    ) -> Option<RegressionReport> {
        let analysis = current.behavior_analysis.as_ref()?;
        if analysis.dry_run {
            return None;
        }
        let previous: Vec<&BehaviorAnalysis> = history
            .iter()
            .filter(|r| r.id != current.id && r.experiment_type == current.experiment_type)
            .filter_map(|r| r.behavior_analysis.as_ref())
            .filter(|a| !a.dry_run)
            .collect();
        if previous.is_empty() {
            return Some(RegressionReport {
                regressed: false,
                compared_against: 0,
                historical_error_rate_increase: None,
                historical_degradation_percent: None,
                findings: vec!["no earlier runs of this type to compare against".to_owned()],
            });
        }

        let historical_errors = mean(previous.iter().map(|a| a.error_rate_increase));
        let historical_degradation = mean(previous.iter().filter_map(|a| a.degradation_percent));
        let mut findings = Vec::new();

        if let Some(hist) = historical_errors {
            let delta = analysis.error_rate_increase - hist;
            if delta > self.tolerance {
                findings.push(format!(
                    "error rate increase {:.1} points vs historical mean {hist:.1}",
                    analysis.error_rate_increase
                ));
            }
        }
        if let (Some(hist), Some(current)) = (historical_degradation, analysis.degradation_percent) {
            if current - hist > self.tolerance {
                findings.push(format!(
                    "response time degradation {current:.0}% vs historical mean {hist:.0}%"
                ));
            }
        }
        if let Some(last) = previous.last() {
            if analysis.resilience_level > last.resilience_level {
                findings.push(format!(
                    "resilience level dropped from {:?} to {:?}",
                    last.resilience_level, analysis.resilience_level
                ));
            }
        }

        Some(RegressionReport {
            regressed: !findings.is_empty(),
            compared_against: previous.len(),
            historical_error_rate_increase: historical_errors,
            historical_degradation_percent: historical_degradation,
            findings,
        })
    }
}

fn describe(value: Option<f64>) -> String {
    value.map_or_else(|| "none".to_owned(), |v| format!("{v:.1}ms"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentId, ExperimentStatus};
    use chrono::Utc;
    use r_chaos_common::{ExperimentConfig, ExperimentType};

    fn snap(response: Option<f64>, error_rate: f64) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::idle(Utc::now());
        snapshot.response_time_ms = response;
        snapshot.error_rate = error_rate;
        snapshot
    }

    fn record(analysis: BehaviorAnalysis) -> ExperimentRecord {
        let ty = ExperimentType::NetworkLatency;
        ExperimentRecord {
            id: ExperimentId::generate(ty, Utc::now()),
            experiment_type: ty,
            config: ExperimentConfig::defaults_for(ty),
            status: ExperimentStatus::Completed,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            phases: Vec::new(),
            pre_snapshot: None,
            post_snapshot: None,
            observations: Vec::new(),
            fault: None,
            simulated: analysis.dry_run,
            recovery_actions: None,
            behavior_analysis: Some(analysis),
            recovery_validation: None,
            regression: None,
            emergency_stop: None,
            manual_intervention_required: false,
            error: None,
        }
    }

    #[test]
    fn large_error_increase_is_poor() {
        let analyzer = RegressionAnalyzer::default();
        let analysis = analyzer.analyze_behavior(
            &[snap(Some(120.0), 10.0), snap(Some(130.0), 85.0)],
            &snap(Some(100.0), 5.0),
            false,
        );
        assert_eq!(analysis.resilience_level, ResilienceLevel::Poor);
        assert_eq!(analysis.peak_error_rate, 85.0);
        assert_eq!(analysis.error_rate_increase, 80.0);
    }

    #[test]
    fn tripled_latency_is_moderate() {
        let analysis = RegressionAnalyzer::default().analyze_behavior(
            &[snap(Some(350.0), 0.0), snap(None, 0.0), snap(Some(350.0), 0.0)],
            &snap(Some(100.0), 0.0),
            false,
        );
        assert_eq!(analysis.resilience_level, ResilienceLevel::Moderate);
        assert_eq!(analysis.degradation_percent, Some(250.0));
    }

    #[test]
    fn undetermined_baseline_yields_no_degradation() {
        let analysis = RegressionAnalyzer::default().analyze_behavior(
            &[snap(Some(350.0), 0.0)],
            &snap(None, 0.0),
            true,
        );
        assert_eq!(analysis.degradation_percent, None);
        assert_eq!(analysis.resilience_level, ResilienceLevel::Good);
        assert!(analysis.dry_run);
        assert!(analysis.recommendations.iter().any(|r| r.contains("simulated")));
    }

    #[test]
    fn recovery_within_tolerance_is_recovered() {
        let validation =
            RegressionAnalyzer::default().validate_recovery(&snap(Some(100.0), 1.0), &snap(Some(110.0), 2.0));
        assert!(validation.recovered);
        assert!(validation.issues.is_empty());
    }

    #[test]
    fn null_post_response_time_is_not_recovered() {
        let validation =
            RegressionAnalyzer::default().validate_recovery(&snap(Some(100.0), 0.0), &snap(None, 0.0));
        assert!(!validation.recovered);
        assert!(validation.undetermined);
        assert_eq!(validation.issues.len(), 1);
    }

    #[test]
    fn slow_or_erroring_recovery_is_flagged() {
        let analyzer = RegressionAnalyzer::default();
        let slow = analyzer.validate_recovery(&snap(Some(100.0), 0.0), &snap(Some(160.0), 0.0));
        assert!(!slow.recovered);
        let erroring = analyzer.validate_recovery(&snap(Some(100.0), 0.0), &snap(Some(100.0), 15.0));
        assert!(!erroring.recovered);
        assert!(!erroring.undetermined);
    }

    #[test]
    fn regression_compares_against_real_runs_only() {
        let analyzer = RegressionAnalyzer::default();
        let baseline = snap(Some(100.0), 0.0);
        let calm = analyzer.analyze_behavior(&[snap(Some(110.0), 2.0)], &baseline, false);
        let simulated = analyzer.analyze_behavior(&[snap(Some(900.0), 90.0)], &baseline, true);
        let history = vec![record(calm.clone()), record(simulated)];

        let worse = analyzer.analyze_behavior(&[snap(Some(400.0), 60.0)], &baseline, false);
        let report = analyzer.detect_regression(&record(worse), &history).unwrap();
        assert!(report.regressed);
        assert_eq!(report.compared_against, 1);

        let steady = analyzer.detect_regression(&record(calm), &history).unwrap();
        assert!(!steady.regressed);
    }

    #[test]
    fn simulated_runs_are_not_evaluated() {
        let analyzer = RegressionAnalyzer::default();
        let simulated =
            analyzer.analyze_behavior(&[snap(Some(100.0), 0.0)], &snap(Some(100.0), 0.0), true);
        assert!(analyzer.detect_regression(&record(simulated), &[]).is_none());
    }
}
