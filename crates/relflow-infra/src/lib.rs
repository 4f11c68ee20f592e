//! Infrastructure layer for relflow.
//!
//! Contains the SQLite implementation of the `WorkflowRepository` trait
//! defined in `relflow-core`, and the loader for the engine's `config.toml`.

pub mod config;
pub mod sqlite;
