//! # Model Locks
//!
//! Mutual exclusion for lifecycle operations on one model name.
//!
//! The controller holds a model's lock for the whole of each mutating
//! operation. [`InProcessLock`] only excludes threads of one process; a
//! deployment where the monitor daemon and manual commands run as separate
//! processes supplies a lock that spans processes (see the binary's
//! file lock).

use crate::{ModelName, OpsError};
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Exclusive access to one model; released on drop.
pub struct ModelLockGuard {
    _held: Box<dyn Any + Send>,
}

impl ModelLockGuard {
    /// Wrap whatever value releases the lock when dropped.
    pub fn new<T: Any + Send>(held: T) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for ModelLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ModelLockGuard")
    }
}

/// Blocking per-model lock.
pub trait ModelLock: Send + Sync {
    /// Block until `model` is held exclusively by the caller.
    fn acquire(&self, model: &ModelName) -> Result<ModelLockGuard, OpsError>;
}

// =============================================================================
// IN-PROCESS LOCK
// =============================================================================

#[derive(Default)]
struct Held {
    models: Mutex<BTreeSet<ModelName>>,
    released: Condvar,
}

/// Lock table shared by the threads of one process.
#[derive(Clone, Default)]
pub struct InProcessLock {
    held: Arc<Held>,
}

impl InProcessLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct InProcessGuard {
    held: Arc<Held>,
    model: ModelName,
}

impl Drop for InProcessGuard {
    fn drop(&mut self) {
        let mut models = self
            .held
            .models
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        models.remove(&self.model);
        self.held.released.notify_all();
    }
}

impl ModelLock for InProcessLock {
    fn acquire(&self, model: &ModelName) -> Result<ModelLockGuard, OpsError> {
        let mut models = self
            .held
            .models
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while models.contains(model) {
            models = self
                .held
                .released
                .wait(models)
                .unwrap_or_else(PoisonError::into_inner);
        }
        models.insert(model.clone());
        Ok(ModelLockGuard::new(InProcessGuard {
            held: Arc::clone(&self.held),
            model: model.clone(),
        }))
    }
}

// =============================================================================
// TESTS
// =============================================================================
