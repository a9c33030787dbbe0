//! # modelops-core
//!
//! The lifecycle controller for modelops - THE LOGIC.
//!
//! This crate moves versions of a predictive model through
//! `None → Staging → Production → Archived`, keeps the serving processes in
//! step with those stage labels, and decides when degraded health warrants a
//! retrain.
//!
//! ## Layout
//!
//! - `types` → identifiers, stages, health samples, `OpsError`
//! - `registry` + `storage` + `formats` → the tracking store
//! - `health` → performance and drift evaluation
//! - `process` → serving process supervision (trait + simulated manager)
//! - `training` → the training collaborator
//! - `lock` → per-model mutual exclusion
//! - `controller` → stage transitions
//! - `monitor` → breach detection driving retrains
//!
//! ## Architectural Constraints
//!
//! - NO async, NO network dependencies (pure Rust)
//! - Every collaborator sits behind a trait so the controller and monitor run
//!   deterministically in tests
//! - Registry mutation always precedes the matching process restart

// =============================================================================
// MODULES
// =============================================================================

pub mod controller;
pub mod formats;
pub mod health;
pub mod lock;
pub mod monitor;
pub mod primitives;
pub mod process;
pub mod registry;
pub mod storage;
pub mod training;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    BreachCause, DeploymentHandle, HealthSample, ModelName, ModelVersion, OpsError,
    PolicyThresholds, Stage, StageTransitionRequest, Version, VersionMetadata, VersionRef,
};

// =============================================================================
// RE-EXPORTS: Registry
// =============================================================================

pub use registry::{InMemoryRegistry, ModelRecord, ModelRegistry, RecordStore, open_registry};
pub use storage::RedbRegistry;

// =============================================================================
// RE-EXPORTS: Lifecycle
// =============================================================================

pub use controller::{
    DeploymentPlan, LifecycleController, LifecycleState, ModelStatus, Operation, ReconcileReport,
    TransitionReport,
};
pub use health::{
    DriftReport, EvaluationWindow, FeatureDistribution, HealthEvaluator, Outcome,
    PerformanceReport,
};
pub use lock::{InProcessLock, ModelLock, ModelLockGuard};
pub use monitor::{BreachAction, HealthSource, Monitor, TickOutcome};
pub use process::{
    ProcessEvent, ProcessManager, ServeCommand, ServeContext, SimulatedProcessManager,
};
pub use training::Trainer;

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{RecordHeader, record_from_bytes, record_to_bytes};
