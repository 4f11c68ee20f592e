//! Observability setup for processes that host the relflow engine.
//!
//! The engine itself only emits `tracing` events and spans; this crate wires
//! them to a subscriber.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
