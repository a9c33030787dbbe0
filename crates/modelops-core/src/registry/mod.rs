//! # Version Registry Client
//!
//! The narrow interface through which the controller reads and mutates stage
//! labels in the tracking store.
//!
//! ## Contract
//!
//! - `latest_version` returns the highest-numbered version in a stage, or
//!   `OpsError::NotFound` (a recoverable precondition failure).
//! - `transition` is idempotent: a version already in the target stage is a
//!   no-op success.
//! - `production_history` is the explicit chronological record rollback
//!   relies on. Listing order is never used for that purpose.
//!
//! ## Backends
//!
//! Backends implement [`RecordStore`] (load / read-modify-write of one
//! [`ModelRecord`]) and get [`ModelRegistry`] for free:
//! - [`InMemoryRegistry`]: volatile, switchable offline for failure tests
//! - [`crate::storage::RedbRegistry`]: durable tracking store on disk

mod memory;
mod record;

pub use memory::InMemoryRegistry;
pub use record::ModelRecord;

use crate::primitives::now_millis;
use crate::storage::RedbRegistry;
use crate::{ModelName, ModelVersion, OpsError, Stage, Version, VersionMetadata, VersionRef};
use std::sync::Arc;

// =============================================================================
// REGISTRY TRAIT
// =============================================================================

/// Stage registry for model versions.
///
/// All methods take `&self`; implementations synchronize internally so a
/// registry can be shared between the monitor and manual operations.
pub trait ModelRegistry: Send + Sync {
    /// Probe the tracking store. Fails with `RegistryUnreachable`.
    fn ping(&self) -> Result<(), OpsError>;

    /// Register a new version in stage `None`.
    fn register_version(
        &self,
        model: &ModelName,
        metadata: VersionMetadata,
    ) -> Result<VersionRef, OpsError>;

    /// Highest-numbered version currently in `stage`.
    fn latest_version(&self, model: &ModelName, stage: Stage) -> Result<VersionRef, OpsError>;

    /// Move a specific version to `target`. Idempotent.
    fn transition(&self, model: &ModelName, version: Version, target: Stage)
    -> Result<(), OpsError>;

    fn get_version(&self, model: &ModelName, version: Version) -> Result<ModelVersion, OpsError>;

    /// All versions of a model, ascending. Empty for an unknown model.
    fn list_versions(&self, model: &ModelName) -> Result<Vec<ModelVersion>, OpsError>;

    /// Versions moved into Production, oldest first.
    fn production_history(&self, model: &ModelName) -> Result<Vec<VersionRef>, OpsError>;
}

// =============================================================================
// RECORD STORE
// =============================================================================

/// Storage primitive behind a registry: whole-record load and update.
///
/// `update` must apply the closure and persist the result atomically; if the
/// closure fails nothing is written.
pub trait RecordStore: Send + Sync {
    fn ping(&self) -> Result<(), OpsError>;

    fn load(&self, model: &ModelName) -> Result<Option<ModelRecord>, OpsError>;

    fn update<T>(
        &self,
        model: &ModelName,
        apply: impl FnOnce(&mut ModelRecord) -> Result<T, OpsError>,
    ) -> Result<T, OpsError>;
}

impl<S: RecordStore> ModelRegistry for S {
    fn ping(&self) -> Result<(), OpsError> {
        RecordStore::ping(self)
    }

    fn register_version(
        &self,
        model: &ModelName,
        metadata: VersionMetadata,
    ) -> Result<VersionRef, OpsError> {
        let version = self.update(model, |record| Ok(record.register(metadata, now_millis())))?;
        Ok(VersionRef::new(model.clone(), version))
    }

    fn latest_version(&self, model: &ModelName, stage: Stage) -> Result<VersionRef, OpsError> {
        self.load(model)?
            .as_ref()
            .and_then(|record| record.latest_in(stage))
            .map(ModelVersion::reference)
            .ok_or_else(|| {
                OpsError::NotFound(format!("no version of '{}' in stage {}", model, stage))
            })
    }

    fn transition(
        &self,
        model: &ModelName,
        version: Version,
        target: Stage,
    ) -> Result<(), OpsError> {
        let changed = self.update(model, |record| {
            record.transition(version, target, now_millis())
        })?;
        if changed {
            tracing::debug!(model = %model, version = %version, stage = %target, "stage updated");
        }
        Ok(())
    }

    fn get_version(&self, model: &ModelName, version: Version) -> Result<ModelVersion, OpsError> {
        self.load(model)?
            .as_ref()
            .and_then(|record| record.get(version))
            .cloned()
            .ok_or_else(|| OpsError::NotFound(format!("version {} of '{}'", version, model)))
    }

    fn list_versions(&self, model: &ModelName) -> Result<Vec<ModelVersion>, OpsError> {
        Ok(self
            .load(model)?
            .map(|record| record.versions)
            .unwrap_or_default())
    }

    fn production_history(&self, model: &ModelName) -> Result<Vec<VersionRef>, OpsError> {
        Ok(self
            .load(model)?
            .map(|record| {
                record
                    .production_history
                    .into_iter()
                    .map(|v| VersionRef::new(model.clone(), v))
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// TRACKING URI
// =============================================================================

/// Open the registry a tracking URI points at.
///
/// - `memory://` → a fresh [`InMemoryRegistry`]
/// - `redb://<path>`, `file:<path>` or a bare path → [`RedbRegistry`]
///
/// Remote schemes are not served by this build and report
/// `RegistryUnreachable`.
pub fn open_registry(tracking_uri: &str) -> Result<Arc<dyn ModelRegistry>, OpsError> {
    let uri = tracking_uri.trim();
    if uri.is_empty() {
        return Err(OpsError::InvalidInput("tracking URI is empty".to_string()));
    }
    if uri == "memory://" || uri == "memory:" {
        return Ok(Arc::new(InMemoryRegistry::new()));
    }
    let path = if let Some(rest) = uri.strip_prefix("redb://") {
        rest
    } else if let Some(rest) = uri.strip_prefix("file://") {
        rest
    } else if let Some(rest) = uri.strip_prefix("file:") {
        rest
    } else if uri.contains("://") {
        return Err(OpsError::RegistryUnreachable(format!(
            "unsupported tracking URI scheme: {}",
            uri
        )));
    } else {
        uri
    };
    Ok(Arc::new(RedbRegistry::open(path)?))
}
