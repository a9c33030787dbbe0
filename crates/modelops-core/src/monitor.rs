//! # Monitor
//!
//! One health check per `tick`: fetch outcomes and feature distributions,
//! evaluate them, and trigger `retrain_and_redeploy` on a policy breach.
//!
//! ## Breach episodes
//!
//! A breach opens an episode and fires exactly one retrain. Further breaching
//! ticks inside the episode are suppressed. The episode closes on the first
//! healthy tick, or immediately when the retrain fails so the next breach can
//! try again.
//!
//! `tick` never returns an error: every failure is logged and reported as a
//! [`TickOutcome`], and the caller moves on to the next tick. Timing lives in
//! the caller (the app's daemon task, or a test calling `tick` directly).

use crate::controller::{LifecycleController, TransitionReport};
use crate::health::{EvaluationWindow, FeatureDistribution, HealthEvaluator, Outcome};
use crate::primitives::DEFAULT_EVALUATION_WINDOW;
use crate::{BreachCause, HealthSample, ModelName, OpsError, PolicyThresholds};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// HEALTH SOURCE
// =============================================================================

/// Where the monitor reads serving outcomes and feature distributions.
///
/// `InsufficientData` from any method means "nothing to evaluate yet" and is
/// treated as a missing signal, not a failure.
pub trait HealthSource: Send + Sync {
    fn outcomes(
        &self,
        model: &ModelName,
        window: EvaluationWindow,
    ) -> Result<Vec<Outcome>, OpsError>;

    /// Distribution captured when the serving model was trained.
    fn reference(&self, model: &ModelName) -> Result<FeatureDistribution, OpsError>;

    /// Distribution of recent serving inputs.
    fn current(&self, model: &ModelName) -> Result<FeatureDistribution, OpsError>;
}

fn or_empty<T: Default>(result: Result<T, OpsError>) -> Result<T, OpsError> {
    match result {
        Err(OpsError::InsufficientData(_)) => Ok(T::default()),
        other => other,
    }
}

// =============================================================================
// TICK OUTCOME
// =============================================================================

/// What the monitor did about a breach.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BreachAction {
    Retrained(TransitionReport),
    /// Episode already open; no new retrain.
    Suppressed,
    RetrainFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TickOutcome {
    Healthy(HealthSample),
    Breach {
        sample: HealthSample,
        causes: Vec<BreachCause>,
        action: BreachAction,
    },
    /// Health could not be evaluated this tick.
    Failed(String),
}

impl TickOutcome {
    #[must_use]
    pub fn retrained(&self) -> bool {
        matches!(
            self,
            TickOutcome::Breach {
                action: BreachAction::Retrained(_),
                ..
            }
        )
    }
}

// =============================================================================
// MONITOR
// =============================================================================

pub struct Monitor {
    controller: Arc<LifecycleController>,
    source: Arc<dyn HealthSource>,
    evaluator: HealthEvaluator,
    thresholds: PolicyThresholds,
    model: ModelName,
    window: Duration,
    episode_open: bool,
}

impl Monitor {
    #[must_use]
    pub fn new(
        controller: Arc<LifecycleController>,
        source: Arc<dyn HealthSource>,
        thresholds: PolicyThresholds,
        model: ModelName,
    ) -> Self {
        Self {
            controller,
            source,
            evaluator: HealthEvaluator::new(thresholds.drift_sensitivity),
            thresholds,
            model,
            window: DEFAULT_EVALUATION_WINDOW,
            episode_open: false,
        }
    }

    /// Look-back window for performance evaluation.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn model(&self) -> &ModelName {
        &self.model
    }

    #[must_use]
    pub fn thresholds(&self) -> &PolicyThresholds {
        &self.thresholds
    }

    #[must_use]
    pub fn episode_open(&self) -> bool {
        self.episode_open
    }

    /// Evaluate health at `now_ms` without acting on it.
    pub fn observe(&self, now_ms: u64) -> Result<HealthSample, OpsError> {
        let window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
        let window = EvaluationWindow::ending_at(now_ms, window_ms);

        let outcomes = or_empty(self.source.outcomes(&self.model, window))?;
        let reference = or_empty(self.source.reference(&self.model))?;
        let current = or_empty(self.source.current(&self.model))?;

        Ok(self
            .evaluator
            .sample(&outcomes, window, &reference, &current, now_ms))
    }

    /// One monitoring cycle.
    pub fn tick(&mut self, now_ms: u64) -> TickOutcome {
        let sample = match self.observe(now_ms) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(model = %self.model, error = %e, "health evaluation failed");
                return TickOutcome::Failed(e.to_string());
            }
        };

        let causes = sample.breaches(&self.thresholds);
        if causes.is_empty() {
            if self.episode_open {
                tracing::info!(model = %self.model, "health restored, breach episode closed");
            }
            self.episode_open = false;
            tracing::debug!(
                model = %self.model,
                performance = ?sample.performance,
                drift = ?sample.drift_magnitude,
                "healthy"
            );
            return TickOutcome::Healthy(sample);
        }

        if self.episode_open {
            tracing::debug!(model = %self.model, "breach persists, retrain already triggered");
            return TickOutcome::Breach {
                sample,
                causes,
                action: BreachAction::Suppressed,
            };
        }

        self.episode_open = true;
        for cause in &causes {
            tracing::warn!(model = %self.model, cause = %cause, "policy breach");
        }

        let action = match self.controller.retrain_and_redeploy(&self.model) {
            Ok(report) => {
                tracing::info!(
                    model = %self.model,
                    version = %report.version,
                    "retrained version serving in production"
                );
                BreachAction::Retrained(report)
            }
            Err(e) => {
                self.episode_open = false;
                tracing::error!(model = %self.model, error = %e, "retrain failed");
                BreachAction::RetrainFailed(e.to_string())
            }
        };

        TickOutcome::Breach {
            sample,
            causes,
            action,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::controller::DeploymentPlan;
    use crate::process::{ServeCommand, SimulatedProcessManager};
    use crate::training::Trainer;
    use crate::{InMemoryRegistry, ModelRegistry, VersionMetadata, VersionRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSource {
        score_pairs: Mutex<Vec<Outcome>>,
        reference: Mutex<FeatureDistribution>,
        current: Mutex<FeatureDistribution>,
        fail: Mutex<bool>,
    }

    impl ScriptedSource {
        /// Perfect predictions, or predictions mirrored around the mean.
        fn set_quality(&self, good: bool) {
            let outcomes = (0..10)
                .map(|i| {
                    let actual = f64::from(i);
                    let predicted = if good { actual } else { 9.0 - actual };
                    Outcome {
                        timestamp_ms: 1_000,
                        predicted,
                        actual,
                    }
                })
                .collect();
            *self.score_pairs.lock().unwrap() = outcomes;
        }

        /// Same `age` values on both sides, or current shifted far past the
        /// reference range.
        fn set_drift(&self, shifted: bool) {
            let spread = |offset: f64| -> Vec<f64> {
                (0..200).map(|i: i32| f64::from(i) + offset).collect()
            };
            *self.reference.lock().unwrap() =
                FeatureDistribution::new().with_feature("age", spread(0.0));
            let offset = if shifted { 150.0 } else { 0.0 };
            *self.current.lock().unwrap() =
                FeatureDistribution::new().with_feature("age", spread(offset));
        }
    }

    impl HealthSource for ScriptedSource {
        fn outcomes(
            &self,
            _model: &ModelName,
            _window: EvaluationWindow,
        ) -> Result<Vec<Outcome>, OpsError> {
            if *self.fail.lock().unwrap() {
                return Err(OpsError::IoError("outcomes unavailable".to_string()));
            }
            Ok(self.score_pairs.lock().unwrap().clone())
        }

        fn reference(&self, _model: &ModelName) -> Result<FeatureDistribution, OpsError> {
            let reference = self.reference.lock().unwrap().clone();
            if reference == FeatureDistribution::new() {
                return Err(OpsError::InsufficientData("no reference".to_string()));
            }
            Ok(reference)
        }

        fn current(&self, _model: &ModelName) -> Result<FeatureDistribution, OpsError> {
            Ok(self.current.lock().unwrap().clone())
        }
    }

    struct CountingTrainer {
        registry: Arc<InMemoryRegistry>,
        calls: AtomicUsize,
        fail: Mutex<bool>,
    }

    impl Trainer for CountingTrainer {
        fn train(&self, model: &ModelName) -> Result<VersionRef, OpsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().unwrap() {
                return Err(OpsError::Training("fit diverged".to_string()));
            }
            self.registry
                .register_version(model, VersionMetadata::default())
        }
    }

    fn setup() -> (Monitor, Arc<ScriptedSource>, Arc<CountingTrainer>) {
        let registry = Arc::new(InMemoryRegistry::new());
        let trainer = Arc::new(CountingTrainer {
            registry: Arc::clone(&registry),
            calls: AtomicUsize::new(0),
            fail: Mutex::new(false),
        });
        let controller = Arc::new(LifecycleController::new(
            registry,
            Arc::new(SimulatedProcessManager::new()),
            trainer.clone(),
            DeploymentPlan {
                staging_port: 8001,
                production_port: 8000,
                serve_command: ServeCommand::new("serve"),
            },
        ));
        let source = Arc::new(ScriptedSource::default());
        let monitor = Monitor::new(
            controller,
            source.clone(),
            PolicyThresholds::default(),
            ModelName::new("claims").unwrap(),
        )
        .with_window(Duration::from_secs(60));
        (monitor, source, trainer)
    }

    #[test]
    fn healthy_ticks_never_retrain() {
        let (mut monitor, source, trainer) = setup();
        source.set_quality(true);
        for _ in 0..5 {
            assert!(matches!(monitor.tick(2_000), TickOutcome::Healthy(_)));
        }
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_data_counts_as_healthy() {
        let (mut monitor, _source, trainer) = setup();
        let outcome = monitor.tick(2_000);
        assert!(matches!(outcome, TickOutcome::Healthy(ref s) if s.performance.is_none()));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_retrain_per_breach_episode() {
        let (mut monitor, source, trainer) = setup();
        source.set_quality(false);

        assert!(monitor.tick(2_000).retrained());
        for _ in 0..3 {
            let outcome = monitor.tick(2_000);
            assert!(matches!(
                outcome,
                TickOutcome::Breach {
                    action: BreachAction::Suppressed,
                    ..
                }
            ));
        }
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 1);

        // Recovery closes the episode; the next breach fires again.
        source.set_quality(true);
        monitor.tick(2_000);
        assert!(!monitor.episode_open());
        source.set_quality(false);
        assert!(monitor.tick(2_000).retrained());
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_retrain_allows_next_attempt() {
        let (mut monitor, source, trainer) = setup();
        source.set_quality(false);
        *trainer.fail.lock().unwrap() = true;

        let outcome = monitor.tick(2_000);
        assert!(matches!(
            outcome,
            TickOutcome::Breach {
                action: BreachAction::RetrainFailed(_),
                ..
            }
        ));
        assert!(!monitor.episode_open());

        *trainer.fail.lock().unwrap() = false;
        assert!(monitor.tick(2_000).retrained());
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn source_failure_is_absorbed() {
        let (mut monitor, source, trainer) = setup();
        *source.fail.lock().unwrap() = true;
        assert!(matches!(monitor.tick(2_000), TickOutcome::Failed(_)));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drift_alone_triggers_retrain() {
        let (mut monitor, source, trainer) = setup();
        source.set_quality(true);
        source.set_drift(true);

        let outcome = monitor.tick(2_000);
        let TickOutcome::Breach { causes, action, .. } = outcome else {
            panic!("expected a breach, got {outcome:?}");
        };
        assert_eq!(causes.len(), 1);
        assert!(matches!(causes[0], BreachCause::Drift { magnitude, .. } if magnitude > 0.2));
        assert!(matches!(action, BreachAction::Retrained(_)));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unshifted_features_are_not_drift() {
        let (mut monitor, source, trainer) = setup();
        source.set_quality(true);
        source.set_drift(false);

        let outcome = monitor.tick(2_000);
        assert!(matches!(outcome, TickOutcome::Healthy(ref s) if !s.drift_detected));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn both_signals_breaching_retrain_once() {
        let (mut monitor, source, trainer) = setup();
        source.set_quality(false);
        source.set_drift(true);

        let outcome = monitor.tick(2_000);
        let TickOutcome::Breach { causes, action, .. } = outcome else {
            panic!("expected a breach, got {outcome:?}");
        };
        assert!(matches!(causes[0], BreachCause::Performance { .. }));
        assert!(matches!(causes[1], BreachCause::Drift { .. }));
        assert!(matches!(action, BreachAction::Retrained(_)));

        let again = monitor.tick(2_000);
        assert!(matches!(
            again,
            TickOutcome::Breach {
                action: BreachAction::Suppressed,
                ..
            }
        ));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outcomes_outside_window_are_ignored() {
        let (mut monitor, source, trainer) = setup();
        source.set_quality(false);
        // Window is 60s ending at now; outcomes sit at t=1s.
        let outcome = monitor.tick(1_000_000);
        assert!(matches!(outcome, TickOutcome::Healthy(_)));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 0);
    }
}
