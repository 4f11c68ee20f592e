//! Workflow orchestration core for relflow.
//!
//! This crate holds the definition builder, the execution engine and the
//! "ports" (repository traits) that the infrastructure layer implements.
//! It depends only on `relflow-types` -- never on `relflow-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
