//! # External Collaborators
//!
//! Adapters between the controller's traits and the outside world:
//! - [`CommandTrainer`]: runs the configured training command and registers
//!   the version it produced
//! - [`FileHealthSource`]: reads serving outcomes and feature distributions
//!   from JSON files in the monitoring directory
//! - [`run_data_command`]: runs the dataset preparation command

use modelops_core::health::EvaluationWindow;
use modelops_core::{
    FeatureDistribution, HealthSource, ModelName, ModelRegistry, OpsError, Outcome, Trainer,
    VersionMetadata, VersionRef,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Maximum size of a monitoring data file (100 MB).
const MAX_HEALTH_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Lines of stderr quoted in a failure message.
const STDERR_TAIL_LINES: usize = 5;

pub const OUTCOMES_FILE: &str = "outcomes.json";
pub const REFERENCE_FILE: &str = "reference.json";
pub const CURRENT_FILE: &str = "current.json";

// =============================================================================
// TRAINING
// =============================================================================

/// Summary a training command may print as its last stdout line.
#[derive(Debug, Default, Deserialize)]
struct TrainingSummary {
    artifact_uri: Option<String>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
}

/// Trainer that shells out to `TRAIN_COMMAND`.
///
/// The command runs with `MODEL_NAME` and `DATA_VERSION` exported. If its
/// last stdout line is a JSON object with `artifact_uri` and/or `metrics`,
/// those are stored on the new version.
pub struct CommandTrainer {
    registry: Arc<dyn ModelRegistry>,
    argv: Option<Vec<String>>,
    data_version: String,
}

impl CommandTrainer {
    #[must_use]
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        argv: Option<Vec<String>>,
        data_version: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            argv,
            data_version: data_version.into(),
        }
    }
}

impl Trainer for CommandTrainer {
    fn train(&self, model: &ModelName) -> Result<VersionRef, OpsError> {
        let argv = self
            .argv
            .as_ref()
            .ok_or_else(|| OpsError::Training("TRAIN_COMMAND is not configured".to_string()))?;

        tracing::info!(model = %model, command = %argv.join(" "), "running training command");
        let stdout = run_captured(
            argv,
            &[
                ("MODEL_NAME", model.as_str()),
                ("DATA_VERSION", self.data_version.as_str()),
            ],
        )
        .map_err(OpsError::Training)?;

        let summary = parse_summary(&stdout);
        let metadata = VersionMetadata {
            artifact_uri: summary.artifact_uri,
            data_version: Some(self.data_version.clone()),
            metrics: summary.metrics,
        };
        let version = self.registry.register_version(model, metadata)?;
        tracing::info!(version = %version, "training registered new version");
        Ok(version)
    }
}

fn parse_summary(stdout: &str) -> TrainingSummary {
    let Some(last) = stdout.lines().rev().find(|l| !l.trim().is_empty()) else {
        return TrainingSummary::default();
    };
    serde_json::from_str(last.trim()).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "training output has no JSON summary");
        TrainingSummary::default()
    })
}

// =============================================================================
// DATA PREPARATION
// =============================================================================

/// Run `DATA_COMMAND` with `DATA_VERSION` exported.
pub fn run_data_command(argv: Option<&[String]>, data_version: &str) -> Result<(), OpsError> {
    let argv = argv
        .ok_or_else(|| OpsError::InvalidInput("DATA_COMMAND is not configured".to_string()))?;
    tracing::info!(command = %argv.join(" "), data_version, "running data command");
    run_captured(argv, &[("DATA_VERSION", data_version)])
        .map(|_| ())
        .map_err(OpsError::Process)
}

/// Run to completion, returning stdout or a message with the stderr tail.
fn run_captured(argv: &[String], env: &[(&str, &str)]) -> Result<String, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;
    let output = Command::new(program)
        .args(args)
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("failed to start '{}': {}", program, e))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        tracing::debug!(program = %program, "{}", line);
    }
    if !output.status.success() {
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        return Err(format!("'{}' exited with {}: {}", program, output.status, tail));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// =============================================================================
// HEALTH DATA
// =============================================================================

/// Health source reading JSON files from one directory:
/// - `outcomes.json`: array of `{timestamp_ms, predicted, actual}`
/// - `reference.json`, `current.json`: `{feature: [values...]}`
///
/// A missing file means there is nothing to evaluate yet.
#[derive(Debug, Clone)]
pub struct FileHealthSource {
    dir: PathBuf,
}

impl FileHealthSource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, OpsError> {
        let path = self.dir.join(name);
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OpsError::InsufficientData(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(OpsError::IoError(format!(
                    "Cannot read '{}': {}",
                    path.display(),
                    e
                )));
            }
        };
        if metadata.len() > MAX_HEALTH_FILE_SIZE {
            return Err(OpsError::InvalidInput(format!(
                "File size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_HEALTH_FILE_SIZE
            )));
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| OpsError::IoError(format!("Cannot read '{}': {}", path.display(), e)))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            OpsError::SerializationError(format!("Invalid {}: {}", path.display(), e))
        })
    }
}

impl HealthSource for FileHealthSource {
    fn outcomes(
        &self,
        _model: &ModelName,
        window: EvaluationWindow,
    ) -> Result<Vec<Outcome>, OpsError> {
        let all: Vec<Outcome> = self.read(OUTCOMES_FILE)?;
        Ok(all
            .into_iter()
            .filter(|o| window.contains(o.timestamp_ms))
            .collect())
    }

    fn reference(&self, _model: &ModelName) -> Result<FeatureDistribution, OpsError> {
        self.read(REFERENCE_FILE)
    }

    fn current(&self, _model: &ModelName) -> Result<FeatureDistribution, OpsError> {
        self.read(CURRENT_FILE)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use modelops_core::{InMemoryRegistry, Stage};

    #[test]
    fn summary_is_read_from_last_line() {
        let summary = parse_summary(
            "epoch 1\n{\"artifact_uri\": \"runs/7/model\", \"metrics\": {\"r2\": 0.81}}\n\n",
        );
        assert_eq!(summary.artifact_uri.as_deref(), Some("runs/7/model"));
        assert_eq!(summary.metrics.get("r2"), Some(&0.81));
    }

    #[test]
    fn plain_output_yields_empty_summary() {
        let summary = parse_summary("training done\n");
        assert!(summary.artifact_uri.is_none());
        assert!(summary.metrics.is_empty());
    }

    #[test]
    fn unconfigured_trainer_fails_without_registering() {
        let registry = Arc::new(InMemoryRegistry::new());
        let trainer = CommandTrainer::new(registry.clone(), None, "v1");
        let model = ModelName::new("claims").expect("name");

        assert!(matches!(trainer.train(&model), Err(OpsError::Training(_))));
        assert!(registry.list_versions(&model).expect("list").is_empty());
        assert!(registry.latest_version(&model, Stage::None).is_err());
    }

    #[test]
    fn missing_files_are_insufficient_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = FileHealthSource::new(dir.path());
        let model = ModelName::new("claims").expect("name");
        assert!(matches!(
            source.reference(&model),
            Err(OpsError::InsufficientData(_))
        ));
    }
}
