//! # Lifecycle Controller
//!
//! Orchestrates stage transitions for a model by combining the registry and
//! the process manager.
//!
//! ## Ordering
//!
//! Every operation re-reads the registry, mutates it, and only then restarts
//! the matching serving process. A current Production holder is demoted to
//! Archived before its replacement is promoted, so the registry never shows
//! two Production versions, even when a step in between fails.
//!
//! ## Concurrency
//!
//! Mutating operations for one model name are serialized by a per-model lock
//! held for the whole operation. `retrain_and_redeploy` keeps it across
//! training, staging and promotion, so a manual promote or rollback cannot
//! interleave with an automated retrain. The lock defaults to
//! [`InProcessLock`]; controllers in different processes share a
//! [`ModelLock`] set with [`LifecycleController::with_model_lock`].

use crate::lock::{InProcessLock, ModelLock, ModelLockGuard};
use crate::process::{ProcessManager, ServeCommand, ServeContext};
use crate::training::Trainer;
use crate::{
    DeploymentHandle, ModelName, ModelRegistry, ModelVersion, OpsError, Stage,
    StageTransitionRequest, Version, VersionRef,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Attempts made by a restart when graceful shutdowns keep timing out.
const RESTART_ATTEMPTS: usize = 3;

// =============================================================================
// PLAN + REPORTS
// =============================================================================

/// Where each served stage runs and how its process is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPlan {
    pub staging_port: u16,
    pub production_port: u16,
    pub serve_command: ServeCommand,
}

impl DeploymentPlan {
    /// Port bound to a served stage.
    pub fn port_for(&self, stage: Stage) -> Result<u16, OpsError> {
        match stage {
            Stage::Staging => Ok(self.staging_port),
            Stage::Production => Ok(self.production_port),
            other => Err(OpsError::InvalidInput(format!(
                "stage {} has no serving process",
                other
            ))),
        }
    }
}

/// Controller operation, used in reports and log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    DeployStaging,
    Promote,
    /// Transient label while a rollback is in flight.
    RollingBack,
    Retrain,
    Reconcile,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::DeployStaging => "deploy_staging",
            Operation::Promote => "promote",
            Operation::RollingBack => "rollback",
            Operation::Retrain => "retrain_and_redeploy",
            Operation::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

/// Outcome of a transition that ended with a (re)started serving process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionReport {
    pub model: ModelName,
    pub operation: Operation,
    /// Version now holding the target stage.
    pub version: Version,
    /// Version that held the target stage before, if any.
    pub previous: Option<Version>,
    pub handle: DeploymentHandle,
}

/// What `reconcile` did per served stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub model: ModelName,
    /// Processes left running, restarted or not.
    pub running: Vec<DeploymentHandle>,
    /// Stages with no registry holder whose process was stopped.
    pub stopped: Vec<Stage>,
}

/// Coarse lifecycle position of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Unregistered,
    /// Versions exist, none deployed.
    Registered,
    Staged,
    Production,
    /// Every deployed version has been retired.
    Archived,
}

/// Registry view plus live process handles for one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub model: ModelName,
    pub state: LifecycleState,
    pub staging: Option<ModelVersion>,
    pub production: Option<ModelVersion>,
    pub version_count: usize,
    pub production_history: Vec<Version>,
    pub staging_process: Option<DeploymentHandle>,
    pub production_process: Option<DeploymentHandle>,
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Drives Staging → Production → Archived for models in a registry.
pub struct LifecycleController {
    registry: Arc<dyn ModelRegistry>,
    processes: Arc<dyn ProcessManager>,
    trainer: Arc<dyn Trainer>,
    plan: DeploymentPlan,
    locks: Arc<dyn ModelLock>,
}

impl LifecycleController {
    #[must_use]
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        processes: Arc<dyn ProcessManager>,
        trainer: Arc<dyn Trainer>,
        plan: DeploymentPlan,
    ) -> Self {
        Self {
            registry,
            processes,
            trainer,
            plan,
            locks: Arc::new(InProcessLock::new()),
        }
    }

    /// Replace the in-process model lock, e.g. with one shared by every
    /// process that drives the same tracking store.
    #[must_use]
    pub fn with_model_lock(mut self, locks: Arc<dyn ModelLock>) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn plan(&self) -> &DeploymentPlan {
        &self.plan
    }

    /// Move the newest unassigned version to Staging and (re)start the
    /// staging server.
    pub fn deploy_staging(&self, model: &ModelName) -> Result<TransitionReport, OpsError> {
        let _guard = self.lock_model(model)?;

        let request =
            StageTransitionRequest::new(model.clone(), Stage::Staging).from_stage(Stage::None);
        let candidate = self.candidate(&request)?;
        self.stage_locked(&candidate, Operation::DeployStaging)
    }

    /// Promote the Staging holder to Production and restart the production
    /// server.
    pub fn promote(&self, model: &ModelName) -> Result<TransitionReport, OpsError> {
        let _guard = self.lock_model(model)?;
        self.promote_locked(model, Operation::Promote)
    }

    /// Restore the most recent former Production holder other than the
    /// current one.
    pub fn rollback(&self, model: &ModelName) -> Result<TransitionReport, OpsError> {
        let _guard = self.lock_model(model)?;

        let history = self.registry.production_history(model)?;
        let current = self.current_holder(model, Stage::Production)?;

        // With nothing in Production the last recorded holder is the anchor.
        let anchor = current.or_else(|| history.last().map(|r| r.version));
        let target = history
            .iter()
            .rev()
            .map(|r| r.version)
            .find(|v| Some(*v) != anchor)
            .ok_or_else(|| {
                OpsError::NoEligibleVersion(format!(
                    "'{}' has fewer than two distinct Production versions in its history",
                    model
                ))
            })?;
        self.registry.get_version(model, target)?;

        tracing::info!(
            model = %model,
            operation = %Operation::RollingBack,
            from = ?current,
            to = %target,
            "rolling back production"
        );

        if let Some(current) = current {
            self.registry.transition(model, current, Stage::Archived)?;
        }
        self.registry.transition(model, target, Stage::Production)?;
        let handle = self.restart(model, Stage::Production, target)?;

        Ok(TransitionReport {
            model: model.clone(),
            operation: Operation::RollingBack,
            version: target,
            previous: current,
            handle,
        })
    }

    /// Train a new version, stage it, then promote it, all under one lock.
    pub fn retrain_and_redeploy(&self, model: &ModelName) -> Result<TransitionReport, OpsError> {
        let _guard = self.lock_model(model)?;

        tracing::info!(model = %model, operation = %Operation::Retrain, "training new version");
        let trained = self.trainer.train(model)?;
        if &trained.model != model {
            return Err(OpsError::Training(format!(
                "trainer registered {} while retraining '{}'",
                trained, model
            )));
        }

        self.stage_locked(&trained, Operation::Retrain)?;
        self.promote_locked(model, Operation::Retrain)
    }

    /// Make serving processes match the registry's stage holders.
    pub fn reconcile(&self, model: &ModelName) -> Result<ReconcileReport, OpsError> {
        let _guard = self.lock_model(model)?;

        let mut report = ReconcileReport {
            model: model.clone(),
            running: Vec::new(),
            stopped: Vec::new(),
        };

        for stage in Stage::SERVED {
            match self.current_holder(model, stage)? {
                Some(version) => {
                    let handle = match self.processes.handle(stage) {
                        Some(h) if h.version == Some(version) => h,
                        _ => self.restart(model, stage, version)?,
                    };
                    report.running.push(handle);
                }
                None => {
                    if self.processes.handle(stage).is_some() {
                        self.retire(stage)?;
                        report.stopped.push(stage);
                    }
                }
            }
        }

        tracing::info!(
            model = %model,
            operation = %Operation::Reconcile,
            running = report.running.len(),
            stopped = report.stopped.len(),
            "processes reconciled"
        );
        Ok(report)
    }

    /// Read-only snapshot; takes no lock.
    pub fn status(&self, model: &ModelName) -> Result<ModelStatus, OpsError> {
        let versions = self.registry.list_versions(model)?;
        let history = self.registry.production_history(model)?;

        let holder = |stage: Stage| {
            versions
                .iter()
                .filter(|v| v.stage == stage)
                .max_by_key(|v| v.version)
                .cloned()
        };
        let staging = holder(Stage::Staging);
        let production = holder(Stage::Production);

        let state = if versions.is_empty() {
            LifecycleState::Unregistered
        } else if production.is_some() {
            LifecycleState::Production
        } else if staging.is_some() {
            LifecycleState::Staged
        } else if versions.iter().any(|v| v.stage == Stage::Archived) {
            LifecycleState::Archived
        } else {
            LifecycleState::Registered
        };

        Ok(ModelStatus {
            model: model.clone(),
            state,
            staging,
            production,
            version_count: versions.len(),
            production_history: history.into_iter().map(|r| r.version).collect(),
            staging_process: self.processes.handle(Stage::Staging),
            production_process: self.processes.handle(Stage::Production),
        })
    }

    // -------------------------------------------------------------------------
    // Internals (caller holds the model lock)
    // -------------------------------------------------------------------------

    fn lock_model(&self, model: &ModelName) -> Result<ModelLockGuard, OpsError> {
        let guard = self.locks.acquire(model)?;
        tracing::debug!(model = %model, "model lock acquired");
        Ok(guard)
    }

    /// Highest version in the request's source stage.
    fn candidate(&self, request: &StageTransitionRequest) -> Result<VersionRef, OpsError> {
        let source = request.source.unwrap_or(Stage::None);
        match self.registry.latest_version(&request.model, source) {
            Ok(found) => Ok(found),
            Err(OpsError::NotFound(_)) => Err(OpsError::NoEligibleVersion(format!(
                "{}: no version in stage {}",
                request, source
            ))),
            Err(e) => Err(e),
        }
    }

    fn current_holder(&self, model: &ModelName, stage: Stage) -> Result<Option<Version>, OpsError> {
        match self.registry.latest_version(model, stage) {
            Ok(found) => Ok(Some(found.version)),
            Err(OpsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stage_locked(
        &self,
        candidate: &VersionRef,
        operation: Operation,
    ) -> Result<TransitionReport, OpsError> {
        let model = &candidate.model;
        let previous = self.current_holder(model, Stage::Staging)?;

        // Older Staging holders are retired so the stage has one holder.
        for stale in self
            .registry
            .list_versions(model)?
            .iter()
            .filter(|v| v.stage == Stage::Staging && v.version != candidate.version)
        {
            self.registry.transition(model, stale.version, Stage::Archived)?;
        }
        self.registry
            .transition(model, candidate.version, Stage::Staging)?;
        let handle = self.restart(model, Stage::Staging, candidate.version)?;

        tracing::info!(
            model = %model,
            operation = %operation,
            version = %candidate.version,
            port = handle.port,
            pid = handle.pid,
            "version deployed to staging"
        );
        Ok(TransitionReport {
            model: model.clone(),
            operation,
            version: candidate.version,
            previous,
            handle,
        })
    }

    fn promote_locked(
        &self,
        model: &ModelName,
        operation: Operation,
    ) -> Result<TransitionReport, OpsError> {
        let request = StageTransitionRequest::new(model.clone(), Stage::Production)
            .from_stage(Stage::Staging);
        let candidate = self.candidate(&request)?;
        let previous = self.current_holder(model, Stage::Production)?;

        if let Some(previous) = previous.filter(|v| *v != candidate.version) {
            self.registry.transition(model, previous, Stage::Archived)?;
        }
        self.registry
            .transition(model, candidate.version, Stage::Production)?;
        let handle = self.restart(model, Stage::Production, candidate.version)?;

        // The promoted version no longer backs the staging server.
        if self.current_holder(model, Stage::Staging)?.is_none() {
            self.retire(Stage::Staging)?;
        }

        tracing::info!(
            model = %model,
            operation = %operation,
            version = %candidate.version,
            previous = ?previous,
            port = handle.port,
            pid = handle.pid,
            "version promoted to production"
        );
        Ok(TransitionReport {
            model: model.clone(),
            operation,
            version: candidate.version,
            previous,
            handle,
        })
    }

    /// Start `version` on the stage's port, forcing out processes that ignore
    /// the graceful signal.
    fn restart(
        &self,
        model: &ModelName,
        stage: Stage,
        version: Version,
    ) -> Result<DeploymentHandle, OpsError> {
        let port = self.plan.port_for(stage)?;
        let command = self.plan.serve_command.render(&ServeContext {
            model: model.clone(),
            stage,
            port,
            version: Some(version),
        });

        let mut attempt = 1;
        loop {
            match self
                .processes
                .ensure_running(stage, port, &command, Some(version))
            {
                Err(OpsError::ShutdownTimeout {
                    stage: holder,
                    pid,
                    waited_ms,
                    ..
                }) if attempt < RESTART_ATTEMPTS => {
                    tracing::warn!(
                        stage = %holder,
                        pid,
                        waited_ms,
                        "graceful shutdown timed out, forcing termination"
                    );
                    self.processes.force_stop(holder)?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Stop a stage's process, escalating on timeout.
    fn retire(&self, stage: Stage) -> Result<(), OpsError> {
        match self.processes.stop(stage) {
            Err(OpsError::ShutdownTimeout { pid, waited_ms, .. }) => {
                tracing::warn!(
                    stage = %stage,
                    pid,
                    waited_ms,
                    "graceful shutdown timed out, forcing termination"
                );
                self.processes.force_stop(stage)
            }
            other => other,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
