//! Event distribution for workflow progress.

pub mod bus;

pub use bus::EventBus;
