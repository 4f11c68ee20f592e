//! Workflow engine core: definitions, DAG scheduling, and durable checkpointing.
//!
//! This module contains the "brain" of the workflow engine:
//! - `param` -- typed parameter declarations and run-start input validation
//! - `dag` -- dependency graph, cycle rejection, wave computation
//! - `definition` -- definition builder, typed node handles, node bodies
//! - `context` -- per-attempt task context handed to node bodies
//! - `retry` -- retry policy and backoff computation
//! - `checkpoint` -- durable checkpoint manager for crash recovery
//! - `listener` -- progress listener trait and built-in sinks
//! - `approval` -- approval broker for human sign-off gates
//! - `registry` -- explicit name -> definition registry used on resume
//! - `executor` -- event-driven parallel DAG engine

pub mod approval;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod listener;
pub mod param;
pub mod registry;
pub mod retry;

pub use approval::{ApprovalBroker, ApprovalError};
pub use context::TaskContext;
pub use definition::{
    ActionHandle, AttemptTimeout, Definition, DefinitionBuilder, DefinitionError, NodeRef, TaskHandle,
};
pub use executor::{Engine, EngineError, RunHandle, RunOutputs};
pub use listener::{
    EventBusListener, FanoutListener, ListenerError, NoopListener, ProgressListener,
    TracingListener,
};
pub use param::{Param, ParamDef, ParamKind, ValidationError};
pub use registry::{DefinitionRegistry, RegistryError};
pub use retry::RetryPolicy;
