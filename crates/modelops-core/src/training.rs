//! # Training Collaborator
//!
//! Produces a new model version from the current dataset. Model fitting is
//! out of scope for this crate: implementations run an external command (see
//! the app's `CommandTrainer`) and register the result.

use crate::{ModelName, OpsError, VersionRef};

/// Fits a new version of `model` and registers it in stage `None`.
pub trait Trainer: Send + Sync {
    fn train(&self, model: &ModelName) -> Result<VersionRef, OpsError>;
}
