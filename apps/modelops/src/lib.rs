//! # modelops
//!
//! The binary side of the lifecycle control plane: CLI, settings, OS process
//! supervision, cross-process model locks, external training and health collaborators, the monitor
//! daemon and the serving shell. All lifecycle decisions live in
//! `modelops-core`.

pub mod api;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod daemon;
pub mod locking;
pub mod supervisor;
