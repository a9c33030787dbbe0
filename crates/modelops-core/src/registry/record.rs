//! # Model Record
//!
//! Per-model registry state shared by every registry backend.
//!
//! A `ModelRecord` holds all versions of one model plus the chronological
//! production history. Backends load a record, mutate it with the methods
//! below, and store it back in one step, so every rule about stages lives
//! here and nowhere else.

use crate::{ModelName, ModelVersion, OpsError, Stage, Version, VersionMetadata};
use serde::{Deserialize, Serialize};

/// All registry state for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model: ModelName,
    /// Ascending by version number.
    pub versions: Vec<ModelVersion>,
    /// Every version moved into Production, oldest first, one entry per move.
    pub production_history: Vec<Version>,
}

impl ModelRecord {
    #[must_use]
    pub fn new(model: ModelName) -> Self {
        Self {
            model,
            versions: Vec::new(),
            production_history: Vec::new(),
        }
    }

    #[must_use]
    pub fn get(&self, version: Version) -> Option<&ModelVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    /// Highest-numbered version currently in `stage`.
    #[must_use]
    pub fn latest_in(&self, stage: Stage) -> Option<&ModelVersion> {
        self.versions
            .iter()
            .filter(|v| v.stage == stage)
            .max_by_key(|v| v.version)
    }

    /// Allocate the next version number in stage `None`.
    pub fn register(&mut self, metadata: VersionMetadata, now_ms: u64) -> Version {
        let version = self
            .versions
            .iter()
            .map(|v| v.version)
            .max()
            .map_or(Version(1), Version::next);

        self.versions.push(ModelVersion {
            model: self.model.clone(),
            version,
            stage: Stage::None,
            metadata,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        });
        version
    }

    /// Move `version` to `target`.
    ///
    /// Returns `Ok(false)` when the version is already in `target`. Moving a
    /// version into Production archives every other Production holder in the
    /// same mutation and appends to the production history.
    pub fn transition(
        &mut self,
        version: Version,
        target: Stage,
        now_ms: u64,
    ) -> Result<bool, OpsError> {
        let current = self
            .get(version)
            .map(|v| v.stage)
            .ok_or_else(|| {
                OpsError::NotFound(format!("version {} of '{}'", version, self.model))
            })?;

        if current == target {
            return Ok(false);
        }

        if target == Stage::Production {
            for other in self
                .versions
                .iter_mut()
                .filter(|v| v.stage == Stage::Production && v.version != version)
            {
                other.stage = Stage::Archived;
                other.updated_at_ms = now_ms;
            }
            self.production_history.push(version);
        }

        if let Some(entry) = self.versions.iter_mut().find(|v| v.version == version) {
            entry.stage = target;
            entry.updated_at_ms = now_ms;
        }
        Ok(true)
    }

    /// Number of versions currently holding Production.
    #[must_use]
    pub fn production_count(&self) -> usize {
        self.versions
            .iter()
            .filter(|v| v.stage == Stage::Production)
            .count()
    }
}
