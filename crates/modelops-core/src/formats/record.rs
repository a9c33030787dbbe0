//! # Record Format
//!
//! Binary serialization for `ModelRecord` values stored in the tracking store.
//!
//! Format: Header (5 bytes) + postcard-serialized record.
//! - 4 bytes: Magic ("MOPS")
//! - 1 byte: Version
//!
//! Size and header are validated before the payload is parsed, so a corrupted
//! store yields `SerializationError` instead of a large allocation.

use crate::primitives::{FORMAT_VERSION, MAGIC_BYTES, MAX_RECORD_SIZE};
use crate::registry::ModelRecord;
use crate::OpsError;

const HEADER_LEN: usize = 5;

// =============================================================================
// HEADER
// =============================================================================

/// The header precedes every encoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl RecordHeader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *MAGIC_BYTES,
            version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), OpsError> {
        if &self.magic != MAGIC_BYTES {
            return Err(OpsError::SerializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(OpsError::SerializationError(format!(
                "Unsupported record version: {} (expected {})",
                self.version, FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OpsError> {
        if bytes.len() < HEADER_LEN {
            return Err(OpsError::SerializationError(
                "Header too short".to_string(),
            ));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: bytes[4],
        })
    }
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Encode a record (header + payload).
pub fn record_to_bytes(record: &ModelRecord) -> Result<Vec<u8>, OpsError> {
    let payload =
        postcard::to_stdvec(record).map_err(|e| OpsError::SerializationError(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&RecordHeader::new().to_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a record produced by [`record_to_bytes`].
pub fn record_from_bytes(bytes: &[u8]) -> Result<ModelRecord, OpsError> {
    if bytes.len() > MAX_RECORD_SIZE {
        return Err(OpsError::SerializationError(format!(
            "Record size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_RECORD_SIZE
        )));
    }

    let header = RecordHeader::from_bytes(bytes)?;
    header.validate()?;

    postcard::from_bytes(&bytes[HEADER_LEN..]).map_err(|e| {
        OpsError::SerializationError(format!("Failed to deserialize model record: {}", e))
    })
}

// =============================================================================
// TESTS
// =============================================================================
