//! # Storage Module
//!
//! Durable tracking store backends.

mod redb_registry;

pub use redb_registry::RedbRegistry;
