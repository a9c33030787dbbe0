//! # Settings
//!
//! Runtime configuration, built once at startup and passed by reference.
//!
//! Layers, lowest to highest precedence:
//! 1. compiled defaults
//! 2. an optional TOML file (`--config`)
//! 3. environment variables
//!
//! An environment value that does not parse is logged and ignored, leaving
//! the lower layer in effect. A config file that cannot be read or parsed is
//! an error, since the operator asked for it explicitly.

use modelops_core::primitives::{
    DEFAULT_DRIFT_SENSITIVITY, DEFAULT_EVALUATION_WINDOW, DEFAULT_PERFORMANCE_FLOOR,
    DEFAULT_POLL_INTERVAL, DEFAULT_PRODUCTION_PORT, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_STAGING_PORT,
};
use modelops_core::{DeploymentPlan, ModelName, OpsError, PolicyThresholds, ServeCommand, Stage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Model managed when `MODEL_NAME` is not set.
pub const DEFAULT_MODEL_NAME: &str = "health_claim_cost_model";

pub const DEFAULT_TRACKING_URI: &str = "redb://modelops.db";

pub const DEFAULT_DATA_VERSION: &str = "v1";

/// Maximum config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// SETTINGS
// =============================================================================

/// Immutable runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub model_name: ModelName,
    /// Stage `serve` loads when no stage is given.
    pub model_stage: Stage,
    pub data_version: String,
    pub monitoring_interval: Duration,
    pub performance_threshold: f64,
    pub drift_threshold: f64,
    pub performance_window: Duration,
    pub tracking_uri: String,
    pub staging_port: u16,
    pub production_port: u16,
    pub shutdown_timeout: Duration,
    pub train_command: Option<Vec<String>>,
    pub data_command: Option<Vec<String>>,
    pub serve_command: Option<ServeCommand>,
    pub monitoring_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl Settings {
    /// Compiled defaults.
    pub fn defaults() -> Result<Self, OpsError> {
        Ok(Self {
            model_name: ModelName::new(DEFAULT_MODEL_NAME)?,
            model_stage: Stage::Production,
            data_version: DEFAULT_DATA_VERSION.to_string(),
            monitoring_interval: DEFAULT_POLL_INTERVAL,
            performance_threshold: DEFAULT_PERFORMANCE_FLOOR,
            drift_threshold: DEFAULT_DRIFT_SENSITIVITY,
            performance_window: DEFAULT_EVALUATION_WINDOW,
            tracking_uri: DEFAULT_TRACKING_URI.to_string(),
            staging_port: DEFAULT_STAGING_PORT,
            production_port: DEFAULT_PRODUCTION_PORT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            train_command: None,
            data_command: None,
            serve_command: None,
            monitoring_dir: PathBuf::from("monitoring"),
            run_dir: PathBuf::from("run"),
        })
    }
}

/// Keys accepted in the TOML config file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    model_name: Option<String>,
    model_stage: Option<String>,
    data_version: Option<String>,
    monitoring_interval: Option<u64>,
    performance_threshold: Option<f64>,
    drift_threshold: Option<f64>,
    performance_window: Option<u64>,
    tracking_uri: Option<String>,
    staging_port: Option<u16>,
    production_port: Option<u16>,
    shutdown_timeout: Option<u64>,
    train_command: Option<String>,
    data_command: Option<String>,
    serve_command: Option<String>,
    monitoring_dir: Option<PathBuf>,
    run_dir: Option<PathBuf>,
}

impl Settings {
    /// Load from an optional config file and the process environment.
    pub fn load(config: Option<&Path>) -> Result<Self, OpsError> {
        Self::from_lookup(config, |key| std::env::var(key).ok())
    }

    /// Load from an optional config file and an arbitrary variable lookup.
    pub fn from_lookup(
        config: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, OpsError> {
        let mut settings = Self::defaults()?;
        if let Some(path) = config {
            settings.apply_file(read_config_file(path)?)?;
        }
        settings.apply_env(&lookup);
        settings.validate()?;
        Ok(settings)
    }

    /// Checks that span more than one key.
    fn validate(&self) -> Result<(), OpsError> {
        // One port per stage; a shared port would let promote kill staging.
        if self.staging_port == self.production_port {
            return Err(OpsError::InvalidInput(format!(
                "staging and production cannot share port {}",
                self.production_port
            )));
        }
        Ok(())
    }

    /// Policy handed to the monitor.
    #[must_use]
    pub fn thresholds(&self) -> PolicyThresholds {
        PolicyThresholds {
            performance_floor: self.performance_threshold,
            drift_sensitivity: self.drift_threshold,
            poll_interval: self.monitoring_interval,
        }
    }

    /// Ports and serve command for the controller. `fallback` is used when no
    /// serve command is configured.
    #[must_use]
    pub fn deployment_plan(&self, fallback: ServeCommand) -> DeploymentPlan {
        DeploymentPlan {
            staging_port: self.staging_port,
            production_port: self.production_port,
            serve_command: self.serve_command.clone().unwrap_or(fallback),
        }
    }

    fn apply_file(&mut self, file: FileSettings) -> Result<(), OpsError> {
        if let Some(name) = file.model_name {
            self.model_name = ModelName::new(name)?;
        }
        if let Some(stage) = file.model_stage {
            self.model_stage = stage.parse()?;
        }
        if let Some(v) = file.data_version {
            self.data_version = v;
        }
        if let Some(secs) = file.monitoring_interval {
            self.monitoring_interval = positive_secs("monitoring_interval", secs)?;
        }
        if let Some(v) = file.performance_threshold {
            self.performance_threshold = finite("performance_threshold", v)?;
        }
        if let Some(v) = file.drift_threshold {
            self.drift_threshold = finite("drift_threshold", v)?;
        }
        if let Some(secs) = file.performance_window {
            self.performance_window = positive_secs("performance_window", secs)?;
        }
        if let Some(v) = file.tracking_uri {
            self.tracking_uri = v;
        }
        if let Some(v) = file.staging_port {
            self.staging_port = v;
        }
        if let Some(v) = file.production_port {
            self.production_port = v;
        }
        if let Some(secs) = file.shutdown_timeout {
            self.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(line) = file.train_command {
            self.train_command = split_command(&line);
        }
        if let Some(line) = file.data_command {
            self.data_command = split_command(&line);
        }
        if let Some(line) = file.serve_command {
            self.serve_command = ServeCommand::parse(&line);
        }
        if let Some(v) = file.monitoring_dir {
            self.monitoring_dir = v;
        }
        if let Some(v) = file.run_dir {
            self.run_dir = v;
        }
        Ok(())
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MODEL_NAME") {
            match ModelName::new(v.trim()) {
                Ok(name) => self.model_name = name,
                Err(e) => ignore("MODEL_NAME", &v, &e),
            }
        }
        if let Some(v) = parse_env(&get, "MODEL_STAGE") {
            self.model_stage = v;
        }
        if let Some(v) = get("DATA_VERSION") {
            self.data_version = v.trim().to_string();
        }
        if let Some(secs) = parse_env::<u64>(&get, "MONITORING_INTERVAL") {
            match positive_secs("MONITORING_INTERVAL", secs) {
                Ok(d) => self.monitoring_interval = d,
                Err(e) => ignore("MONITORING_INTERVAL", &secs.to_string(), &e),
            }
        }
        if let Some(v) = parse_env::<f64>(&get, "PERFORMANCE_THRESHOLD") {
            match finite("PERFORMANCE_THRESHOLD", v) {
                Ok(v) => self.performance_threshold = v,
                Err(e) => ignore("PERFORMANCE_THRESHOLD", &v.to_string(), &e),
            }
        }
        if let Some(v) = parse_env::<f64>(&get, "DRIFT_THRESHOLD") {
            match finite("DRIFT_THRESHOLD", v) {
                Ok(v) => self.drift_threshold = v,
                Err(e) => ignore("DRIFT_THRESHOLD", &v.to_string(), &e),
            }
        }
        if let Some(secs) = parse_env::<u64>(&get, "PERFORMANCE_WINDOW") {
            match positive_secs("PERFORMANCE_WINDOW", secs) {
                Ok(d) => self.performance_window = d,
                Err(e) => ignore("PERFORMANCE_WINDOW", &secs.to_string(), &e),
            }
        }
        if let Some(v) = get("TRACKING_URI") {
            self.tracking_uri = v.trim().to_string();
        }
        if let Some(v) = parse_env(&get, "STAGING_PORT") {
            self.staging_port = v;
        }
        if let Some(v) = parse_env(&get, "PRODUCTION_PORT") {
            self.production_port = v;
        }
        if let Some(secs) = parse_env(&get, "SHUTDOWN_TIMEOUT") {
            self.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = get("TRAIN_COMMAND") {
            self.train_command = split_command(&v);
        }
        if let Some(v) = get("DATA_COMMAND") {
            self.data_command = split_command(&v);
        }
        if let Some(v) = get("SERVE_COMMAND") {
            self.serve_command = ServeCommand::parse(&v);
        }
        if let Some(v) = get("MONITORING_DIR") {
            self.monitoring_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = get("RUN_DIR") {
            self.run_dir = PathBuf::from(v.trim());
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn read_config_file(path: &Path) -> Result<FileSettings, OpsError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        OpsError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
    })?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(OpsError::InvalidInput(format!(
            "Config file {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            MAX_CONFIG_FILE_SIZE
        )));
    }
    let text = std::fs::read_to_string(path).map_err(|e| {
        OpsError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
    })?;
    toml::from_str(&text).map_err(|e| {
        OpsError::InvalidInput(format!("Invalid config '{}': {}", path.display(), e))
    })
}

fn parse_env<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            ignore(key, &raw, &e);
            None
        }
    }
}

fn ignore(key: &str, raw: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(
        variable = key,
        value = raw,
        error = %error,
        "ignoring unparseable environment value, using default"
    );
}

fn positive_secs(key: &str, secs: u64) -> Result<Duration, OpsError> {
    if secs == 0 {
        return Err(OpsError::InvalidInput(format!("{} must be positive", key)));
    }
    Ok(Duration::from_secs(secs))
}

fn finite(key: &str, value: f64) -> Result<f64, OpsError> {
    if !value.is_finite() {
        return Err(OpsError::InvalidInput(format!("{} must be finite", key)));
    }
    Ok(value)
}

/// Whitespace-split argv. `None` when blank.
fn split_command(line: &str) -> Option<Vec<String>> {
    let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() { None } else { Some(argv) }
}

// =============================================================================
// TESTS
// =============================================================================
