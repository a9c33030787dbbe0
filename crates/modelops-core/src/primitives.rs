//! # Control Primitives
//!
//! Hardcoded runtime constants for the modelops lifecycle controller.
//!
//! These values are compiled into the binary. Anything an operator may want
//! to tune at runtime lives in `PolicyThresholds` or the app-level settings;
//! the constants here are defaults and hard bounds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Magic bytes for the modelops record format header.
///
/// - Record Header = Magic Bytes ("MOPS") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"MOPS";

/// Current serialization format version for registry records.
///
/// Increment this when making breaking changes to `ModelRecord`.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum length for model names.
pub const MAX_MODEL_NAME_LENGTH: usize = 128;

/// Maximum encoded size of a single model record (16 MB).
///
/// Validated before deserialization so a corrupted store cannot force a
/// huge allocation.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// DEPLOYMENT DEFAULTS
// =============================================================================

/// Port the production serving process listens on.
pub const DEFAULT_PRODUCTION_PORT: u16 = 8000;

/// Port the staging serving process listens on.
pub const DEFAULT_STAGING_PORT: u16 = 8001;

/// Bounded wait for a graceful shutdown before `ShutdownTimeout` is raised.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// POLICY DEFAULTS
// =============================================================================

/// Minimum acceptable performance score (R²).
pub const DEFAULT_PERFORMANCE_FLOOR: f64 = 0.7;

/// PSI above which a feature is considered drifted.
pub const DEFAULT_DRIFT_SENSITIVITY: f64 = 0.2;

/// Default monitor cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Default look-back window for performance evaluation.
pub const DEFAULT_EVALUATION_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Number of quantile bins used by the PSI drift test.
pub const PSI_BINS: usize = 10;

/// Smoothing added to empty PSI bins so the log term stays finite.
pub const PSI_EPSILON: f64 = 1e-4;

// =============================================================================
// TIME
// =============================================================================

/// Milliseconds since the Unix epoch.
///
/// Clocks set before 1970 report 0 rather than failing.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
