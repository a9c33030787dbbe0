//! # redb-backed Tracking Store
//!
//! A durable model registry using the redb embedded database.
//!
//! Each model is one row: model name -> encoded `ModelRecord`. Every registry
//! mutation is a single read-modify-write transaction, so stage changes and
//! the production history append commit together or not at all.
//!
//! ## Sharing the file
//!
//! The controller, CLI verbs run by an operator and the monitor may live in
//! different processes. redb takes an exclusive lock on an open database, so
//! the file is opened per operation and the open is retried for a bounded
//! time while another process holds it.

use crate::formats::{record_from_bytes, record_to_bytes};
use crate::registry::{ModelRecord, RecordStore};
use crate::{ModelName, OpsError};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Table for model records: model name -> header + postcard bytes
const MODELS: TableDefinition<&str, &[u8]> = TableDefinition::new("models");

/// How many times an open is attempted while the file is locked.
const OPEN_ATTEMPTS: u32 = 40;

/// Pause between open attempts.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(25);

fn store_err(e: impl std::fmt::Display) -> OpsError {
    OpsError::RegistryUnreachable(e.to_string())
}

/// A disk-backed model registry using redb.
#[derive(Debug, Clone)]
pub struct RedbRegistry {
    path: PathBuf,
}

impl RedbRegistry {
    /// Open or create a tracking store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OpsError> {
        let registry = Self {
            path: path.as_ref().to_path_buf(),
        };

        // Create the table up front so read transactions never miss it.
        let db = registry.database()?;
        let write_txn = db.begin_write().map_err(store_err)?;
        {
            let _ = write_txn.open_table(MODELS).map_err(store_err)?;
        }
        write_txn.commit().map_err(store_err)?;

        Ok(registry)
    }

    fn database(&self) -> Result<Database, OpsError> {
        let mut last_error = String::new();
        for attempt in 0..OPEN_ATTEMPTS {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < OPEN_ATTEMPTS {
                        std::thread::sleep(OPEN_RETRY_DELAY);
                    }
                }
            }
        }
        Err(OpsError::RegistryUnreachable(format!(
            "cannot open tracking store {}: {}",
            self.path.display(),
            last_error
        )))
    }
}

impl RecordStore for RedbRegistry {
    fn ping(&self) -> Result<(), OpsError> {
        let db = self.database()?;
        let read_txn = db.begin_read().map_err(store_err)?;
        let _ = read_txn.open_table(MODELS).map_err(store_err)?;
        Ok(())
    }

    fn load(&self, model: &ModelName) -> Result<Option<ModelRecord>, OpsError> {
        let db = self.database()?;
        let read_txn = db.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(MODELS).map_err(store_err)?;
        let bytes = table
            .get(model.as_str())
            .map_err(store_err)?
            .map(|guard| guard.value().to_vec());

        bytes.map(|b| record_from_bytes(&b)).transpose()
    }

    fn update<T>(
        &self,
        model: &ModelName,
        apply: impl FnOnce(&mut ModelRecord) -> Result<T, OpsError>,
    ) -> Result<T, OpsError> {
        let db = self.database()?;
        let write_txn = db.begin_write().map_err(store_err)?;

        let out = {
            let mut table = write_txn.open_table(MODELS).map_err(store_err)?;
            let existing = table
                .get(model.as_str())
                .map_err(store_err)?
                .map(|guard| guard.value().to_vec());

            let mut record = match existing {
                Some(bytes) => record_from_bytes(&bytes)?,
                None => ModelRecord::new(model.clone()),
            };

            // An error here drops the transaction uncommitted.
            let out = apply(&mut record)?;

            let encoded = record_to_bytes(&record)?;
            table
                .insert(model.as_str(), encoded.as_slice())
                .map_err(store_err)?;
            out
        };

        write_txn.commit().map_err(store_err)?;
        Ok(out)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ModelRegistry, Stage, Version, VersionMetadata};

    fn temp_registry() -> (tempfile::TempDir, RedbRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = RedbRegistry::open(dir.path().join("tracking.db")).expect("open");
        (dir, registry)
    }

    #[test]
    fn state_persists_across_reopen() {
        let (dir, registry) = temp_registry();
        let model = ModelName::new("claims").expect("name");

        let v1 = registry
            .register_version(&model, VersionMetadata::default())
            .expect("register");
        registry
            .transition(&model, v1.version, Stage::Production)
            .expect("promote");
        drop(registry);

        let reopened = RedbRegistry::open(dir.path().join("tracking.db")).expect("reopen");
        let holder = reopened
            .latest_version(&model, Stage::Production)
            .expect("production");
        assert_eq!(holder.version, Version(1));
        assert_eq!(
            reopened.production_history(&model).expect("history").len(),
            1
        );
    }

    #[test]
    fn failed_mutation_is_not_committed() {
        let (_dir, registry) = temp_registry();
        let model = ModelName::new("claims").expect("name");
        registry
            .register_version(&model, VersionMetadata::default())
            .expect("register");

        assert!(registry.transition(&model, Version(5), Stage::Staging).is_err());
        let versions = registry.list_versions(&model).expect("list");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].stage, Stage::None);
    }

    #[test]
    fn metadata_round_trips_through_store() {
        let (_dir, registry) = temp_registry();
        let model = ModelName::new("claims").expect("name");
        let mut metadata = VersionMetadata {
            artifact_uri: Some("s3://models/claims/1".to_string()),
            data_version: Some("v2".to_string()),
            ..VersionMetadata::default()
        };
        metadata.metrics.insert("rmse".to_string(), 1520.5);

        let v = registry
            .register_version(&model, metadata.clone())
            .expect("register");
        let stored = registry.get_version(&model, v.version).expect("get");
        assert_eq!(stored.metadata, metadata);
    }
}
