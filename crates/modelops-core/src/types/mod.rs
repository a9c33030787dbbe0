//! # Core Type Definitions
//!
//! This module contains the data model shared by every modelops component:
//! - Model and version identifiers (`ModelName`, `Version`, `VersionRef`)
//! - Lifecycle stages (`Stage`)
//! - Registry records (`ModelVersion`, `VersionMetadata`)
//! - Per-operation values (`StageTransitionRequest`, `HealthSample`)
//! - Startup policy (`PolicyThresholds`) and runtime bindings (`DeploymentHandle`)
//! - Error types (`OpsError`)
//!
//! The controller never owns a `ModelVersion`. It holds a `VersionRef` for the
//! duration of one operation and re-reads the registry before every transition.

use crate::primitives::{
    DEFAULT_DRIFT_SENSITIVITY, DEFAULT_PERFORMANCE_FLOOR, DEFAULT_POLL_INTERVAL,
    MAX_MODEL_NAME_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Name of a registered model.
///
/// Restricted to ASCII alphanumerics, `_`, `-` and `.` so it can be embedded
/// in file names, URLs and process arguments without escaping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelName(String);

impl ModelName {
    /// Validate and wrap a model name.
    pub fn new(name: impl Into<String>) -> Result<Self, OpsError> {
        let name = name.into();
        if name.is_empty() {
            return Err(OpsError::InvalidInput("model name is empty".to_string()));
        }
        if name.len() > MAX_MODEL_NAME_LENGTH {
            return Err(OpsError::InvalidInput(format!(
                "model name exceeds {} bytes",
                MAX_MODEL_NAME_LENGTH
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(OpsError::InvalidInput(format!(
                "model name '{}' contains invalid character {:?}",
                name, bad
            )));
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry-assigned version number. Monotonic per model, starting at 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(pub u64);

impl Version {
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version allocated after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transient reference to one version of one model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionRef {
    pub model: ModelName,
    pub version: Version,
}

impl VersionRef {
    #[must_use]
    pub fn new(model: ModelName, version: Version) -> Self {
        Self { model, version }
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.model, self.version)
    }
}

// =============================================================================
// STAGE
// =============================================================================

/// Lifecycle stage label attached to a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Registered but not deployed anywhere.
    None,
    Staging,
    Production,
    /// Retired; eligible as a rollback target only through production history.
    Archived,
}

impl Stage {
    /// Stages that own a serving process.
    pub const SERVED: [Stage; 2] = [Stage::Staging, Stage::Production];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Stage::None => "None",
            Stage::Staging => "Staging",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" | "prod" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            other => Err(OpsError::InvalidInput(format!("unknown stage '{}'", other))),
        }
    }
}

// =============================================================================
// REGISTRY RECORDS
// =============================================================================

/// Metadata attached to a version when the training collaborator registers it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VersionMetadata {
    /// Where the fitted artifact lives (opaque to the controller).
    pub artifact_uri: Option<String>,
    /// Dataset version the model was trained on.
    pub data_version: Option<String>,
    /// Training metrics (rmse, mae, r2, ...).
    pub metrics: BTreeMap<String, f64>,
}

/// A model version as stored by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model: ModelName,
    pub version: Version,
    pub stage: Stage,
    pub metadata: VersionMetadata,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl ModelVersion {
    #[must_use]
    pub fn reference(&self) -> VersionRef {
        VersionRef::new(self.model.clone(), self.version)
    }
}

/// One stage move, built per operation and never persisted.
///
/// `source` constrains which stage the candidate is taken from; `None` means
/// the caller already knows the exact version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTransitionRequest {
    pub model: ModelName,
    pub target: Stage,
    pub source: Option<Stage>,
}

impl StageTransitionRequest {
    #[must_use]
    pub fn new(model: ModelName, target: Stage) -> Self {
        Self {
            model,
            target,
            source: None,
        }
    }

    /// Only versions currently in `source` are eligible.
    #[must_use]
    pub fn from_stage(mut self, source: Stage) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for StageTransitionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(source) => write!(f, "{}: {} -> {}", self.model, source, self.target),
            None => write!(f, "{}: -> {}", self.model, self.target),
        }
    }
}

// =============================================================================
// HEALTH
// =============================================================================

/// Why a health sample breached policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BreachCause {
    /// Score fell below the performance floor.
    Performance { score: f64, floor: f64 },
    /// Drift magnitude exceeded the sensitivity.
    Drift { magnitude: f64, sensitivity: f64 },
}

impl fmt::Display for BreachCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreachCause::Performance { score, floor } => {
                write!(f, "performance {:.4} below floor {:.4}", score, floor)
            }
            BreachCause::Drift {
                magnitude,
                sensitivity,
            } => write!(
                f,
                "drift magnitude {:.4} above sensitivity {:.4}",
                magnitude, sensitivity
            ),
        }
    }
}

/// A single observation of model health.
///
/// `performance` and `drift_magnitude` are `None` when the evaluator lacked
/// input; a missing signal never counts as a breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp_ms: u64,
    pub performance: Option<f64>,
    pub drift_detected: bool,
    pub drift_magnitude: Option<f64>,
}

impl HealthSample {
    /// Breach causes under the given policy, performance first.
    #[must_use]
    pub fn breaches(&self, thresholds: &PolicyThresholds) -> Vec<BreachCause> {
        let mut causes = Vec::new();
        if let Some(score) = self.performance.filter(|s| *s < thresholds.performance_floor) {
            causes.push(BreachCause::Performance {
                score,
                floor: thresholds.performance_floor,
            });
        }
        if self.drift_detected {
            causes.push(BreachCause::Drift {
                magnitude: self.drift_magnitude.unwrap_or(0.0),
                sensitivity: thresholds.drift_sensitivity,
            });
        }
        causes
    }
}

/// Policy supplied at startup; immutable for a controller's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyThresholds {
    pub performance_floor: f64,
    pub drift_sensitivity: f64,
    pub poll_interval: Duration,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            performance_floor: DEFAULT_PERFORMANCE_FLOOR,
            drift_sensitivity: DEFAULT_DRIFT_SENSITIVITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

// =============================================================================
// DEPLOYMENT HANDLE
// =============================================================================

/// Runtime binding between a stage, a port and a live serving process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub stage: Stage,
    pub port: u16,
    pub pid: u32,
    /// Version the process was launched to serve, if known.
    pub version: Option<Version>,
    pub started_at_ms: u64,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the modelops system.
///
/// - The controller surfaces every error to its caller
/// - Only the monitor absorbs errors, to keep its loop alive
#[derive(Debug, Error)]
pub enum OpsError {
    /// No version in the expected stage, or an unknown version.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Promote/rollback had no valid source version.
    #[error("No eligible version: {0}")]
    NoEligibleVersion(String),

    /// Health evaluation lacked input.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// A serving process did not exit within the bounded wait.
    #[error("Shutdown timeout: {stage} process {pid} on port {port} still running after {waited_ms} ms")]
    ShutdownTimeout {
        stage: Stage,
        port: u16,
        pid: u32,
        waited_ms: u64,
    },

    /// The tracking store cannot be reached or failed mid-operation.
    #[error("Registry unreachable: {0}")]
    RegistryUnreachable(String),

    /// Caller supplied an invalid value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Spawning or signalling a process failed.
    #[error("Process error: {0}")]
    Process(String),

    /// The training collaborator failed.
    #[error("Training failed: {0}")]
    Training(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================
