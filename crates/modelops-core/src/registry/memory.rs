//! In-memory registry.
//!
//! Volatile stand-in for the tracking store, used by tests and the
//! `memory://` tracking URI. Can be taken offline to exercise
//! `RegistryUnreachable` handling.

use super::{ModelRecord, RecordStore};
use crate::{ModelName, OpsError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct InMemoryRegistry {
    records: Mutex<BTreeMap<ModelName, ModelRecord>>,
    online: AtomicBool,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate the tracking store going away (or coming back).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), OpsError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OpsError::RegistryUnreachable(
                "in-memory registry is offline".to_string(),
            ))
        }
    }
}

impl RecordStore for InMemoryRegistry {
    fn ping(&self) -> Result<(), OpsError> {
        self.check_online()
    }

    fn load(&self, model: &ModelName) -> Result<Option<ModelRecord>, OpsError> {
        self.check_online()?;
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(model).cloned())
    }

    fn update<T>(
        &self,
        model: &ModelName,
        apply: impl FnOnce(&mut ModelRecord) -> Result<T, OpsError>,
    ) -> Result<T, OpsError> {
        self.check_online()?;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        // Work on a copy so a failing closure leaves the stored record untouched.
        let mut record = records
            .get(model)
            .cloned()
            .unwrap_or_else(|| ModelRecord::new(model.clone()));
        let out = apply(&mut record)?;
        records.insert(model.clone(), record);
        Ok(out)
    }
}
