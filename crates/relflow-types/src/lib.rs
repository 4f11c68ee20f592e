//! Shared domain types for relflow.
//!
//! This crate contains the records the workflow engine persists and emits:
//! runs, node records, approval decisions, progress events, engine
//! configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
