//! Two controllers over one tracking store, as the monitor daemon and a CLI
//! verb would run, serialized by the run-directory model lock.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::panic)]

use modelops::locking::FileModelLock;
use modelops_core::{
    DeploymentPlan, LifecycleController, ModelName, ModelRegistry, OpsError, RedbRegistry,
    ServeCommand, SimulatedProcessManager, Stage, Trainer, Version, VersionMetadata, VersionRef,
};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Registers a version, then blocks until released.
struct GatedTrainer {
    registry: Arc<RedbRegistry>,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl Trainer for GatedTrainer {
    fn train(&self, model: &ModelName) -> Result<VersionRef, OpsError> {
        let trained = self
            .registry
            .register_version(model, VersionMetadata::default())?;
        self.entered.lock().unwrap().send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        Ok(trained)
    }
}

struct NoTrainer;

impl Trainer for NoTrainer {
    fn train(&self, _model: &ModelName) -> Result<VersionRef, OpsError> {
        Err(OpsError::Training("not used".to_string()))
    }
}

fn plan() -> DeploymentPlan {
    DeploymentPlan {
        staging_port: 8001,
        production_port: 8000,
        serve_command: ServeCommand::new("serve"),
    }
}

fn controller(
    store: &Path,
    run_dir: &Path,
    trainer: Arc<dyn Trainer>,
) -> (Arc<RedbRegistry>, LifecycleController) {
    let registry = Arc::new(RedbRegistry::open(store).unwrap());
    let controller = LifecycleController::new(
        registry.clone(),
        Arc::new(SimulatedProcessManager::new()),
        trainer,
        plan(),
    )
    .with_model_lock(Arc::new(FileModelLock::new(run_dir).unwrap()));
    (registry, controller)
}

#[test]
fn manual_promote_waits_for_running_retrain() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("tracking.redb");
    let run_dir = dir.path().join("run");
    let model = ModelName::new("claims").unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gated = Arc::new(GatedTrainer {
        registry: Arc::new(RedbRegistry::open(&store).unwrap()),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let (registry, daemon) = controller(&store, &run_dir, gated);
    let (_, operator) = controller(&store, &run_dir, Arc::new(NoTrainer));

    // v1 waits in Staging for a manual promote.
    registry
        .register_version(&model, VersionMetadata::default())
        .unwrap();
    operator.deploy_staging(&model).unwrap();

    let retrain = {
        let model = model.clone();
        std::thread::spawn(move || daemon.retrain_and_redeploy(&model))
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let promote = {
        let model = model.clone();
        std::thread::spawn(move || {
            let result = operator.promote(&model);
            done_tx.send(()).unwrap();
            result
        })
    };

    // Blocked on the model lock while training is in flight.
    assert!(done_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(
        registry
            .latest_version(&model, Stage::Production)
            .is_err()
    );

    release_tx.send(()).unwrap();
    let retrained = retrain.join().unwrap().unwrap();
    assert_eq!(retrained.version, Version(2));

    // Retrain archived v1 from Staging, so the queued promote has nothing left.
    let promoted = promote.join().unwrap();
    assert!(
        matches!(promoted, Err(OpsError::NoEligibleVersion(_))),
        "{promoted:?}"
    );
    assert_eq!(
        registry
            .latest_version(&model, Stage::Production)
            .unwrap()
            .version,
        Version(2)
    );
    assert_eq!(
        registry.get_version(&model, Version(1)).unwrap().stage,
        Stage::Archived
    );
}
