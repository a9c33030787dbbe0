//! # Health Evaluator
//!
//! Pure computation of the two health signals the monitor acts on:
//! - **performance**: R² of recent predictions against observed actuals
//!   (RMSE and MAE are reported alongside)
//! - **drift**: Population Stability Index of current feature values
//!   against the reference distribution captured at training time
//!
//! Both evaluations are deterministic for identical inputs: features are
//! iterated in `BTreeMap` order and values are sorted with `f64::total_cmp`.

use crate::primitives::{PSI_BINS, PSI_EPSILON};
use crate::{HealthSample, OpsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// INPUTS
// =============================================================================

/// One prediction paired with the actual value observed later.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub timestamp_ms: u64,
    pub predicted: f64,
    pub actual: f64,
}

/// Inclusive time window over outcome timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl EvaluationWindow {
    /// Window of `length_ms` ending at `end_ms`.
    #[must_use]
    pub fn ending_at(end_ms: u64, length_ms: u64) -> Self {
        Self {
            start_ms: end_ms.saturating_sub(length_ms),
            end_ms,
        }
    }

    #[must_use]
    pub fn contains(&self, timestamp_ms: u64) -> bool {
        (self.start_ms..=self.end_ms).contains(&timestamp_ms)
    }
}

/// Empirical feature distributions, one column of values per feature.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureDistribution {
    pub features: BTreeMap<String, Vec<f64>>,
}

impl FeatureDistribution {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column insert.
    #[must_use]
    pub fn with_feature(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.features.insert(name.into(), values);
        self
    }
}

// =============================================================================
// REPORTS
// =============================================================================

/// Performance over one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// R² (coefficient of determination). Can be negative for a model worse
    /// than predicting the mean.
    pub score: f64,
    pub rmse: f64,
    pub mae: f64,
    pub samples: usize,
}

/// Drift between reference and current distributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub detected: bool,
    /// Largest per-feature PSI.
    pub magnitude: f64,
    /// Feature with the largest PSI.
    pub feature: Option<String>,
    pub per_feature: BTreeMap<String, f64>,
}

// =============================================================================
// EVALUATOR
// =============================================================================

/// Stateless evaluator configured with the drift sensitivity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthEvaluator {
    drift_sensitivity: f64,
}

impl HealthEvaluator {
    #[must_use]
    pub fn new(drift_sensitivity: f64) -> Self {
        Self { drift_sensitivity }
    }

    /// Score the outcomes whose timestamps fall inside `window`.
    ///
    /// Non-finite pairs are ignored. An empty window is `InsufficientData`.
    pub fn evaluate_performance(
        &self,
        outcomes: &[Outcome],
        window: EvaluationWindow,
    ) -> Result<PerformanceReport, OpsError> {
        let pairs: Vec<(f64, f64)> = outcomes
            .iter()
            .filter(|o| window.contains(o.timestamp_ms))
            .filter(|o| o.predicted.is_finite() && o.actual.is_finite())
            .map(|o| (o.predicted, o.actual))
            .collect();

        if pairs.is_empty() {
            return Err(OpsError::InsufficientData(format!(
                "no outcomes between {} and {}",
                window.start_ms, window.end_ms
            )));
        }

        let n = pairs.len() as f64;
        let mean_actual = pairs.iter().map(|(_, a)| a).sum::<f64>() / n;
        let ss_res: f64 = pairs.iter().map(|(p, a)| (a - p).powi(2)).sum();
        let ss_tot: f64 = pairs.iter().map(|(_, a)| (a - mean_actual).powi(2)).sum();
        let mae = pairs.iter().map(|(p, a)| (a - p).abs()).sum::<f64>() / n;

        let score = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };

        Ok(PerformanceReport {
            score,
            rmse: (ss_res / n).sqrt(),
            mae,
            samples: pairs.len(),
        })
    }

    /// Compare every feature present in both distributions.
    ///
    /// `InsufficientData` when the distributions share no feature or a shared
    /// feature has no finite values on either side.
    pub fn evaluate_drift(
        &self,
        reference: &FeatureDistribution,
        current: &FeatureDistribution,
    ) -> Result<DriftReport, OpsError> {
        let mut per_feature = BTreeMap::new();

        for (name, ref_values) in &reference.features {
            let Some(cur_values) = current.features.get(name) else {
                continue;
            };
            let reference_sorted = finite_sorted(ref_values);
            let current_sorted = finite_sorted(cur_values);
            if reference_sorted.is_empty() || current_sorted.is_empty() {
                return Err(OpsError::InsufficientData(format!(
                    "feature '{}' has no usable values",
                    name
                )));
            }
            per_feature.insert(
                name.clone(),
                population_stability_index(&reference_sorted, &current_sorted),
            );
        }

        if per_feature.is_empty() {
            return Err(OpsError::InsufficientData(
                "reference and current distributions share no features".to_string(),
            ));
        }

        // Strictly greater, so ties keep the alphabetically first feature.
        let mut worst: Option<(&String, f64)> = None;
        for (name, psi) in &per_feature {
            if worst.is_none_or(|(_, best)| *psi > best) {
                worst = Some((name, *psi));
            }
        }
        let (feature, magnitude) = worst
            .map(|(name, psi)| (Some(name.clone()), psi))
            .unwrap_or((None, 0.0));

        Ok(DriftReport {
            detected: magnitude > self.drift_sensitivity,
            magnitude,
            feature,
            per_feature,
        })
    }

    /// Evaluate both signals into one sample. Missing input yields an absent
    /// signal rather than an error.
    #[must_use]
    pub fn sample(
        &self,
        outcomes: &[Outcome],
        window: EvaluationWindow,
        reference: &FeatureDistribution,
        current: &FeatureDistribution,
        now_ms: u64,
    ) -> HealthSample {
        let performance = self
            .evaluate_performance(outcomes, window)
            .ok()
            .map(|r| r.score);
        let drift = self.evaluate_drift(reference, current).ok();

        HealthSample {
            timestamp_ms: now_ms,
            performance,
            drift_detected: drift.as_ref().is_some_and(|d| d.detected),
            drift_magnitude: drift.map(|d| d.magnitude),
        }
    }
}

// =============================================================================
// PSI
// =============================================================================

fn finite_sorted(values: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    out.sort_by(f64::total_cmp);
    out
}

/// PSI over decile bins of the (sorted, non-empty) reference sample.
fn population_stability_index(reference: &[f64], current: &[f64]) -> f64 {
    // Interior edges at the reference deciles.
    let edges: Vec<f64> = (1..PSI_BINS)
        .map(|i| reference[(reference.len() * i / PSI_BINS).min(reference.len() - 1)])
        .collect();

    let ref_counts = bin_counts(reference, &edges);
    let cur_counts = bin_counts(current, &edges);
    let ref_total = reference.len() as f64;
    let cur_total = current.len() as f64;

    ref_counts
        .iter()
        .zip(cur_counts.iter())
        .map(|(&r, &c)| {
            let r_pct = (r as f64 / ref_total).max(PSI_EPSILON);
            let c_pct = (c as f64 / cur_total).max(PSI_EPSILON);
            (c_pct - r_pct) * (c_pct / r_pct).ln()
        })
        .sum()
}

/// Bin `i` holds values `v` with `edges[i-1] < v <= edges[i]`.
fn bin_counts(values: &[f64], edges: &[f64]) -> Vec<usize> {
    let mut counts = vec![0usize; edges.len() + 1];
    for v in values {
        counts[edges.partition_point(|e| e < v)] += 1;
    }
    counts
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(pairs: &[(f64, f64)]) -> Vec<Outcome> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, (p, a))| Outcome {
                timestamp_ms: i as u64 * 10,
                predicted: *p,
                actual: *a,
            })
            .collect()
    }

    fn spread(n: usize, offset: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 + offset).collect()
    }

    #[test]
    fn perfect_predictions_score_one() {
        let evaluator = HealthEvaluator::new(0.2);
        let data = outcomes(&[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]);
        let report = evaluator
            .evaluate_performance(&data, EvaluationWindow::ending_at(100, 100))
            .expect("report");
        assert!((report.score - 1.0).abs() < 1e-12);
        assert_eq!(report.rmse, 0.0);
        assert_eq!(report.samples, 3);
    }

    #[test]
    fn predicting_the_mean_scores_zero() {
        let evaluator = HealthEvaluator::new(0.2);
        let data = outcomes(&[(2.0, 1.0), (2.0, 2.0), (2.0, 3.0)]);
        let report = evaluator
            .evaluate_performance(&data, EvaluationWindow::ending_at(100, 100))
            .expect("report");
        assert!(report.score.abs() < 1e-12);
        assert!((report.mae - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn empty_window_is_insufficient_data() {
        let evaluator = HealthEvaluator::new(0.2);
        let data = outcomes(&[(1.0, 1.0)]);
        let window = EvaluationWindow {
            start_ms: 500,
            end_ms: 900,
        };
        assert!(matches!(
            evaluator.evaluate_performance(&data, window),
            Err(OpsError::InsufficientData(_))
        ));
    }

    #[test]
    fn window_excludes_old_outcomes() {
        let evaluator = HealthEvaluator::new(0.2);
        // Old, wildly wrong prediction at t=0; recent exact ones after.
        let data = outcomes(&[(100.0, 1.0), (2.0, 2.0), (3.0, 3.0), (4.0, 4.0)]);
        let report = evaluator
            .evaluate_performance(&data, EvaluationWindow { start_ms: 10, end_ms: 30 })
            .expect("report");
        assert_eq!(report.samples, 3);
        assert!((report.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn constant_actuals_with_error_score_zero() {
        let evaluator = HealthEvaluator::new(0.2);
        let data = outcomes(&[(1.0, 5.0), (2.0, 5.0)]);
        let report = evaluator
            .evaluate_performance(&data, EvaluationWindow::ending_at(100, 100))
            .expect("report");
        assert_eq!(report.score, 0.0);
    }

    #[test]
    fn identical_distributions_do_not_drift() {
        let evaluator = HealthEvaluator::new(0.2);
        let reference = FeatureDistribution::new().with_feature("age", spread(200, 0.0));
        let report = evaluator
            .evaluate_drift(&reference, &reference.clone())
            .expect("report");
        assert!(!report.detected);
        assert!(report.magnitude.abs() < 1e-9);
    }

    #[test]
    fn shifted_distribution_drifts() {
        let evaluator = HealthEvaluator::new(0.2);
        let reference = FeatureDistribution::new()
            .with_feature("age", spread(200, 0.0))
            .with_feature("bmi", spread(200, 0.0));
        let current = FeatureDistribution::new()
            .with_feature("age", spread(200, 0.0))
            .with_feature("bmi", spread(200, 150.0));

        let report = evaluator.evaluate_drift(&reference, &current).expect("report");
        assert!(report.detected);
        assert_eq!(report.feature.as_deref(), Some("bmi"));
        assert!(report.per_feature["age"] < report.per_feature["bmi"]);
    }

    #[test]
    fn drift_is_deterministic() {
        let evaluator = HealthEvaluator::new(0.2);
        let reference = FeatureDistribution::new().with_feature("x", vec![3.0, 1.0, 2.0, 5.0]);
        let current = FeatureDistribution::new().with_feature("x", vec![9.0, 1.0, 7.0, 5.0]);
        let a = evaluator.evaluate_drift(&reference, &current).expect("a");
        let b = evaluator.evaluate_drift(&reference, &current).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn disjoint_features_are_insufficient() {
        let evaluator = HealthEvaluator::new(0.2);
        let reference = FeatureDistribution::new().with_feature("age", vec![1.0]);
        let current = FeatureDistribution::new().with_feature("bmi", vec![1.0]);
        assert!(matches!(
            evaluator.evaluate_drift(&reference, &current),
            Err(OpsError::InsufficientData(_))
        ));
    }

    #[test]
    fn sample_treats_missing_inputs_as_absent() {
        let evaluator = HealthEvaluator::new(0.2);
        let empty = FeatureDistribution::new();
        let sample = evaluator.sample(&[], EvaluationWindow::ending_at(10, 10), &empty, &empty, 10);
        assert_eq!(sample.performance, None);
        assert!(!sample.drift_detected);
        assert_eq!(sample.drift_magnitude, None);
    }

    #[test]
    fn bin_counts_cover_every_value() {
        let counts = bin_counts(&[0.0, 1.0, 1.5, 2.0, 9.0], &[1.0, 2.0]);
        assert_eq!(counts, vec![2, 2, 1]);
    }
}
