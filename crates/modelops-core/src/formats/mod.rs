//! # Formats Module
//!
//! Binary encoding of registry records. File and database I/O lives in
//! `storage`; this module is pure transformation.

mod record;

pub use record::{RecordHeader, record_from_bytes, record_to_bytes};
