//! # Lifecycle Scenarios
//!
//! End-to-end behaviour of the controller and monitor against the in-memory
//! registry and the simulated process manager.

#![allow(clippy::unwrap_used, clippy::panic)]

use modelops_core::{
    BreachAction, BreachCause, DeploymentPlan, EvaluationWindow, FeatureDistribution, HealthSource,
    InMemoryRegistry, LifecycleController, ModelName, ModelRegistry, Monitor, OpsError, Outcome,
    PolicyThresholds, ProcessEvent, ProcessManager, ServeCommand, SimulatedProcessManager, Stage, TickOutcome,
    Trainer, Version, VersionMetadata, VersionRef,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// FIXTURES
// =============================================================================

struct RegisteringTrainer {
    registry: Arc<InMemoryRegistry>,
    calls: AtomicUsize,
}

impl Trainer for RegisteringTrainer {
    fn train(&self, model: &ModelName) -> Result<VersionRef, OpsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut metadata = VersionMetadata::default();
        metadata.metrics.insert("r2".to_string(), 0.86);
        self.registry.register_version(model, metadata)
    }
}

/// Health data shared between a test and the monitor.
#[derive(Default)]
struct FixedSource {
    outcomes: Mutex<Vec<Outcome>>,
    /// Added to every current `age` value.
    current_shift: Mutex<f64>,
}

impl FixedSource {
    /// Outcomes scoring roughly `score` (R²) at t=1s.
    fn set_score(&self, score: f64) {
        // Predictions shrink toward the mean by a factor giving the target R²:
        // predicted = mean + k * (actual - mean), R² = 1 - (1 - k)².
        let k = 1.0 - (1.0 - score).sqrt();
        let actuals: Vec<f64> = (0..20).map(f64::from).collect();
        let mean = actuals.iter().sum::<f64>() / actuals.len() as f64;
        let outcomes = actuals
            .iter()
            .map(|&actual| Outcome {
                timestamp_ms: 1_000,
                predicted: mean + k * (actual - mean),
                actual,
            })
            .collect();
        *self.outcomes.lock().expect("lock") = outcomes;
    }

    fn shift_current(&self, offset: f64) {
        *self.current_shift.lock().expect("lock") = offset;
    }
}

impl HealthSource for FixedSource {
    fn outcomes(
        &self,
        _model: &ModelName,
        _window: EvaluationWindow,
    ) -> Result<Vec<Outcome>, OpsError> {
        Ok(self.outcomes.lock().expect("lock").clone())
    }

    fn reference(&self, _model: &ModelName) -> Result<FeatureDistribution, OpsError> {
        Ok(FeatureDistribution::new().with_feature("age", (18..65).map(f64::from).collect()))
    }

    fn current(&self, _model: &ModelName) -> Result<FeatureDistribution, OpsError> {
        let shift = *self.current_shift.lock().expect("lock");
        let ages = (18..65).map(|age: i32| f64::from(age) + shift).collect();
        Ok(FeatureDistribution::new().with_feature("age", ages))
    }
}

struct World {
    registry: Arc<InMemoryRegistry>,
    processes: Arc<SimulatedProcessManager>,
    trainer: Arc<RegisteringTrainer>,
    controller: Arc<LifecycleController>,
    model: ModelName,
}

fn world() -> World {
    let registry = Arc::new(InMemoryRegistry::new());
    let processes = Arc::new(SimulatedProcessManager::new());
    let trainer = Arc::new(RegisteringTrainer {
        registry: Arc::clone(&registry),
        calls: AtomicUsize::new(0),
    });
    let controller = Arc::new(LifecycleController::new(
        registry.clone(),
        processes.clone(),
        trainer.clone(),
        DeploymentPlan {
            staging_port: 8001,
            production_port: 8000,
            serve_command: ServeCommand::parse("serve --port {port} --version {version}")
                .expect("command"),
        },
    ));
    World {
        registry,
        processes,
        trainer,
        controller,
        model: ModelName::new("health_claim_cost_model").expect("name"),
    }
}

impl World {
    fn register(&self) -> Version {
        self.registry
            .register_version(&self.model, VersionMetadata::default())
            .expect("register")
            .version
    }

    fn stage_of(&self, version: Version) -> Stage {
        self.registry
            .get_version(&self.model, version)
            .expect("get")
            .stage
    }

    fn production_count(&self) -> usize {
        self.registry
            .list_versions(&self.model)
            .expect("list")
            .iter()
            .filter(|v| v.stage == Stage::Production)
            .count()
    }

    /// Register, stage and promote one new version.
    fn ship(&self) -> Version {
        let v = self.register();
        self.controller.deploy_staging(&self.model).expect("stage");
        self.controller.promote(&self.model).expect("promote");
        v
    }
}

// =============================================================================
// PROMOTION
// =============================================================================

#[test]
fn promoting_v3_archives_prior_holder_and_restarts_production() {
    let w = world();
    let v1 = w.ship();
    let v2 = w.ship();
    assert_eq!(w.stage_of(v1), Stage::Archived);

    let v3 = w.register();
    assert_eq!(v3, Version(3));
    w.controller.deploy_staging(&w.model).expect("stage v3");
    let prod_before = w.processes.handle(Stage::Production).expect("prod handle");

    let report = w.controller.promote(&w.model).expect("promote v3");

    assert_eq!(report.version, v3);
    assert_eq!(report.previous, Some(v2));
    assert_eq!(w.stage_of(v3), Stage::Production);
    assert_eq!(w.stage_of(v2), Stage::Archived);
    assert_eq!(w.production_count(), 1);

    let prod_after = w.processes.handle(Stage::Production).expect("prod handle");
    assert_eq!(prod_after.port, 8000);
    assert_eq!(prod_after.version, Some(v3));
    assert_ne!(prod_after.pid, prod_before.pid);
}

#[test]
fn prior_production_process_stops_before_replacement_starts() {
    let w = world();
    w.ship();
    let old = w.processes.handle(Stage::Production).expect("handle");
    w.ship();
    let new = w.processes.handle(Stage::Production).expect("handle");

    let events = w.processes.events();
    let stopped_at = events
        .iter()
        .position(|e| matches!(e, ProcessEvent::Stopped { pid, .. } if *pid == old.pid))
        .expect("old process stopped");
    let started_at = events
        .iter()
        .position(|e| matches!(e, ProcessEvent::Started { pid, .. } if *pid == new.pid))
        .expect("new process started");

    assert!(stopped_at < started_at);
    assert_eq!(w.processes.peak_processes_per_port(), 1);
}

#[test]
fn serve_command_receives_stage_port_and_version() {
    let w = world();
    w.register();
    w.controller.deploy_staging(&w.model).expect("stage");

    let started: Vec<String> = w
        .processes
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProcessEvent::Started { command, .. } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["serve --port 8001 --version 1".to_string()]);
}

// =============================================================================
// ROLLBACK
// =============================================================================

#[test]
fn rollback_with_single_production_history_is_rejected() {
    let w = world();
    let v1 = w.ship();
    let before = w.registry.list_versions(&w.model).expect("list");
    let events_before = w.processes.events().len();

    assert!(matches!(
        w.controller.rollback(&w.model),
        Err(OpsError::NoEligibleVersion(_))
    ));

    assert_eq!(w.registry.list_versions(&w.model).expect("list"), before);
    assert_eq!(w.stage_of(v1), Stage::Production);
    assert_eq!(w.processes.events().len(), events_before);
}

#[test]
fn rollback_restores_previous_production_version() {
    let w = world();
    let v1 = w.ship();
    let v2 = w.ship();

    let report = w.controller.rollback(&w.model).expect("rollback");

    assert_eq!(report.version, v1);
    assert_eq!(report.previous, Some(v2));
    assert_eq!(w.stage_of(v1), Stage::Production);
    assert_eq!(w.stage_of(v2), Stage::Archived);
    assert_eq!(
        w.processes.handle(Stage::Production).and_then(|h| h.version),
        Some(v1)
    );
}

#[test]
fn repeated_rollback_alternates_between_last_two_holders() {
    let w = world();
    let v1 = w.ship();
    let v2 = w.ship();

    assert_eq!(w.controller.rollback(&w.model).expect("first").version, v1);
    assert_eq!(w.controller.rollback(&w.model).expect("second").version, v2);
    assert_eq!(w.production_count(), 1);
}

#[test]
fn rollback_without_current_holder_uses_history() {
    let w = world();
    let v1 = w.ship();
    let v2 = w.ship();
    w.registry
        .transition(&w.model, v2, Stage::Archived)
        .expect("retire v2");

    let report = w.controller.rollback(&w.model).expect("rollback");
    assert_eq!(report.version, v1);
    assert_eq!(report.previous, None);
}

// =============================================================================
// MONITOR-DRIVEN RETRAIN
// =============================================================================

fn monitor_for(w: &World, source: Arc<FixedSource>) -> Monitor {
    Monitor::new(
        Arc::clone(&w.controller),
        source,
        PolicyThresholds {
            performance_floor: 0.7,
            drift_sensitivity: 0.2,
            poll_interval: Duration::from_secs(3600),
        },
        w.model.clone(),
    )
    .with_window(Duration::from_secs(3600))
}

#[test]
fn low_performance_retrains_into_production() {
    let w = world();
    let v1 = w.ship();
    let source = Arc::new(FixedSource::default());
    source.set_score(0.5);
    let mut monitor = monitor_for(&w, source);

    let outcome = monitor.tick(2_000);

    let TickOutcome::Breach { sample, action, .. } = outcome else {
        panic!("expected breach, got {:?}", outcome);
    };
    let score = sample.performance.expect("score");
    assert!((score - 0.5).abs() < 1e-9);

    let BreachAction::Retrained(report) = action else {
        panic!("expected retrain, got {:?}", action);
    };
    assert_eq!(report.version, Version(2));
    assert_eq!(w.stage_of(report.version), Stage::Production);
    assert_eq!(w.stage_of(v1), Stage::Archived);
    assert_eq!(w.trainer.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn healthy_samples_never_retrain() {
    let w = world();
    w.ship();
    let source = Arc::new(FixedSource::default());
    source.set_score(0.9);
    let mut monitor = monitor_for(&w, source);

    for tick in 0..10 {
        assert!(matches!(monitor.tick(2_000 + tick), TickOutcome::Healthy(_)));
    }
    assert_eq!(w.trainer.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn sustained_breach_retrains_once_per_episode() {
    let w = world();
    w.ship();
    let source = Arc::new(FixedSource::default());
    source.set_score(0.4);
    let mut monitor = monitor_for(&w, Arc::clone(&source));

    for tick in 0..5 {
        monitor.tick(2_000 + tick);
    }
    assert_eq!(w.trainer.calls.load(Ordering::SeqCst), 1);

    source.set_score(0.95);
    monitor.tick(3_000);
    source.set_score(0.4);
    monitor.tick(3_001);
    assert_eq!(w.trainer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(w.production_count(), 1);
}

#[test]
fn input_drift_alone_retrains_into_production() {
    let w = world();
    let v1 = w.ship();
    let source = Arc::new(FixedSource::default());
    source.set_score(0.95);
    source.shift_current(100.0);
    let mut monitor = monitor_for(&w, source);

    let outcome = monitor.tick(2_000);

    let TickOutcome::Breach {
        sample,
        causes,
        action,
    } = outcome
    else {
        panic!("expected breach, got {:?}", outcome);
    };
    assert!(sample.drift_detected);
    assert!(matches!(causes.as_slice(), [BreachCause::Drift { .. }]));
    let BreachAction::Retrained(report) = action else {
        panic!("expected retrain, got {:?}", action);
    };
    assert_eq!(w.stage_of(report.version), Stage::Production);
    assert_eq!(w.stage_of(v1), Stage::Archived);
    assert_eq!(w.trainer.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn simultaneous_performance_and_drift_breach_retrains_once() {
    let w = world();
    w.ship();
    let source = Arc::new(FixedSource::default());
    source.set_score(0.4);
    source.shift_current(100.0);
    let mut monitor = monitor_for(&w, source);

    let first = monitor.tick(2_000);
    let TickOutcome::Breach { causes, .. } = &first else {
        panic!("expected breach, got {:?}", first);
    };
    assert!(matches!(
        causes.as_slice(),
        [BreachCause::Performance { .. }, BreachCause::Drift { .. }]
    ));
    assert!(first.retrained());

    for tick in 1..4 {
        assert!(!monitor.tick(2_000 + tick).retrained());
    }
    assert_eq!(w.trainer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(w.production_count(), 1);
}

#[test]
fn unreachable_registry_keeps_monitor_alive() {
    let w = world();
    w.ship();
    let source = Arc::new(FixedSource::default());
    source.set_score(0.3);
    let mut monitor = monitor_for(&w, Arc::clone(&source));

    w.registry.set_online(false);
    let outcome = monitor.tick(2_000);
    assert!(matches!(
        outcome,
        TickOutcome::Breach {
            action: BreachAction::RetrainFailed(_),
            ..
        }
    ));

    w.registry.set_online(true);
    assert!(monitor.tick(2_001).retrained());
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[test]
fn concurrent_operations_keep_one_production_version() {
    let w = world();
    w.ship();
    w.ship();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let controller = Arc::clone(&w.controller);
            let model = w.model.clone();
            std::thread::spawn(move || {
                if i % 2 == 0 {
                    let _ = controller.rollback(&model);
                } else {
                    let _ = controller.retrain_and_redeploy(&model);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }

    assert_eq!(w.production_count(), 1);
    assert_eq!(w.processes.peak_processes_per_port(), 1);
    let holder = w
        .registry
        .latest_version(&w.model, Stage::Production)
        .expect("holder");
    assert_eq!(
        w.processes.handle(Stage::Production).and_then(|h| h.version),
        Some(holder.version)
    );
}
