//! # Serving Shell Response Types
//!
//! JSON bodies returned by the serving shell.

use modelops_core::{ModelName, ModelVersion, Stage, Version, VersionMetadata};
use serde::{Deserialize, Serialize};

// =============================================================================
// SERVED MODEL
// =============================================================================

/// What this serving process was launched to serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServedModel {
    pub model: ModelName,
    pub stage: Stage,
    pub port: u16,
    pub version: Option<Version>,
    /// Registry record of `version`, when it could be loaded at startup.
    pub record: Option<ModelVersion>,
    pub started_at_ms: u64,
}

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub stage: Stage,
    pub version: Option<u64>,
    pub service_version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn for_served(served: &ServedModel) -> Self {
        Self {
            status: "ok".to_string(),
            model: served.model.to_string(),
            stage: served.stage,
            version: served.version.map(Version::value),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// MODEL RESPONSE
// =============================================================================

/// Metadata of the stage holder this process serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub model: String,
    pub stage: Stage,
    pub port: u16,
    pub version: Option<u64>,
    /// Stage recorded in the registry; may lag behind `stage` after a
    /// transition until the controller restarts this process.
    pub registry_stage: Option<Stage>,
    pub metadata: Option<VersionMetadata>,
    pub created_at_ms: Option<u64>,
    pub started_at_ms: u64,
}

impl From<&ServedModel> for ModelResponse {
    fn from(served: &ServedModel) -> Self {
        Self {
            model: served.model.to_string(),
            stage: served.stage,
            port: served.port,
            version: served.version.map(Version::value),
            registry_stage: served.record.as_ref().map(|r| r.stage),
            metadata: served.record.as_ref().map(|r| r.metadata.clone()),
            created_at_ms: served.record.as_ref().map(|r| r.created_at_ms),
            started_at_ms: served.started_at_ms,
        }
    }
}
