//! Progress listeners: synchronous sinks for node state transitions.
//!
//! The engine calls the run's listener on every transition, for every log
//! line a body emits, and once when the run finishes. Listener failures never
//! affect the run: the engine wraps the listener in a guard that catches
//! errors and panics, logs them, and moves on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relflow_types::event::{NodeEvent, NodeTransition, WorkflowEvent};
use relflow_types::workflow::RunStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::event::bus::EventBus;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),

    #[error("listener closed")]
    Closed,
}

/// Receives run progress.
///
/// Calls are made from the engine's scheduling loop and must return quickly.
pub trait ProgressListener: Send + Sync {
    fn on_transition(&self, event: &NodeEvent) -> Result<(), ListenerError>;

    fn on_log(&self, _run_id: Uuid, _node: &str, _line: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_run_started(&self, _run_id: Uuid, _definition: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_run_finished(
        &self,
        _run_id: Uuid,
        _status: RunStatus,
        _error: Option<&str>,
    ) -> Result<(), ListenerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Built-in listeners
// ---------------------------------------------------------------------------

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ProgressListener for NoopListener {
    fn on_transition(&self, _event: &NodeEvent) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Console/log output through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl ProgressListener for TracingListener {
    fn on_transition(&self, event: &NodeEvent) -> Result<(), ListenerError> {
        let run_id = event.run_id;
        let node = event.node.as_str();
        match &event.transition {
            NodeTransition::Started { attempt } => {
                tracing::info!(run_id = %run_id, node, attempt, "node started");
            }
            NodeTransition::Succeeded { attempt, .. } => {
                tracing::info!(run_id = %run_id, node, attempt, "node succeeded");
            }
            NodeTransition::Retrying {
                attempt,
                error,
                backoff_ms,
            } => {
                tracing::warn!(run_id = %run_id, node, attempt, backoff_ms, error = %error, "node failed, retrying");
            }
            NodeTransition::Failed { attempt, error } => {
                tracing::error!(run_id = %run_id, node, attempt, error = %error, "node failed");
            }
            NodeTransition::Interrupted { attempt, reason } => {
                tracing::warn!(run_id = %run_id, node, attempt, reason = %reason, "node interrupted");
            }
        }
        Ok(())
    }

    fn on_log(&self, run_id: Uuid, node: &str, line: &str) -> Result<(), ListenerError> {
        tracing::debug!(run_id = %run_id, node, "{line}");
        Ok(())
    }

    fn on_run_finished(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), ListenerError> {
        match error {
            Some(error) => tracing::warn!(run_id = %run_id, status = %status, error, "run finished"),
            None => tracing::info!(run_id = %run_id, status = %status, "run finished"),
        }
        Ok(())
    }
}

/// Publishes every callback as a [`WorkflowEvent`] on an [`EventBus`].
#[derive(Debug, Clone)]
pub struct EventBusListener {
    bus: EventBus,
}

impl EventBusListener {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl ProgressListener for EventBusListener {
    fn on_transition(&self, event: &NodeEvent) -> Result<(), ListenerError> {
        self.bus.publish(WorkflowEvent::Node(event.clone()));
        Ok(())
    }

    fn on_log(&self, run_id: Uuid, node: &str, line: &str) -> Result<(), ListenerError> {
        self.bus.publish(WorkflowEvent::Log {
            run_id,
            node: node.to_string(),
            line: line.to_string(),
        });
        Ok(())
    }

    fn on_run_started(&self, run_id: Uuid, definition: &str) -> Result<(), ListenerError> {
        self.bus.publish(WorkflowEvent::RunStarted {
            run_id,
            definition: definition.to_string(),
        });
        Ok(())
    }

    fn on_run_finished(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), ListenerError> {
        self.bus.publish(WorkflowEvent::RunFinished {
            run_id,
            status,
            error: error.map(str::to_string),
        });
        Ok(())
    }
}

/// Forwards to several listeners. Every listener is called even if an
/// earlier one fails; the first error is returned.
#[derive(Clone, Default)]
pub struct FanoutListener {
    listeners: Vec<Arc<dyn ProgressListener>>,
}

impl FanoutListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    fn each(
        &self,
        mut f: impl FnMut(&dyn ProgressListener) -> Result<(), ListenerError>,
    ) -> Result<(), ListenerError> {
        let mut first_err = None;
        for listener in &self.listeners {
            if let Err(e) = f(listener.as_ref()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl ProgressListener for FanoutListener {
    fn on_transition(&self, event: &NodeEvent) -> Result<(), ListenerError> {
        self.each(|l| l.on_transition(event))
    }

    fn on_log(&self, run_id: Uuid, node: &str, line: &str) -> Result<(), ListenerError> {
        self.each(|l| l.on_log(run_id, node, line))
    }

    fn on_run_started(&self, run_id: Uuid, definition: &str) -> Result<(), ListenerError> {
        self.each(|l| l.on_run_started(run_id, definition))
    }

    fn on_run_finished(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), ListenerError> {
        self.each(|l| l.on_run_finished(run_id, status, error))
    }
}

// ---------------------------------------------------------------------------
// GuardedListener
// ---------------------------------------------------------------------------

/// Engine-side wrapper: errors and panics are logged and ignored, slow calls
/// are reported.
#[derive(Clone)]
pub(crate) struct GuardedListener {
    inner: Arc<dyn ProgressListener>,
    slow_threshold: Duration,
}

impl GuardedListener {
    pub(crate) fn new(inner: Arc<dyn ProgressListener>, slow_threshold: Duration) -> Self {
        Self {
            inner,
            slow_threshold,
        }
    }

    pub(crate) fn transition(&self, event: &NodeEvent) {
        self.call("on_transition", event.run_id, || self.inner.on_transition(event));
    }

    pub(crate) fn log(&self, run_id: Uuid, node: &str, line: &str) {
        self.call("on_log", run_id, || self.inner.on_log(run_id, node, line));
    }

    pub(crate) fn run_started(&self, run_id: Uuid, definition: &str) {
        self.call("on_run_started", run_id, || {
            self.inner.on_run_started(run_id, definition)
        });
    }

    pub(crate) fn run_finished(&self, run_id: Uuid, status: RunStatus, error: Option<&str>) {
        self.call("on_run_finished", run_id, || {
            self.inner.on_run_finished(run_id, status, error)
        });
    }

    fn call(
        &self,
        callback: &'static str,
        run_id: Uuid,
        f: impl FnOnce() -> Result<(), ListenerError>,
    ) {
        let started = Instant::now();
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(run_id = %run_id, callback, error = %e, "progress listener failed, ignoring");
            }
            Err(_) => {
                tracing::warn!(run_id = %run_id, callback, "progress listener panicked, ignoring");
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.slow_threshold {
            tracing::warn!(
                run_id = %run_id,
                callback,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow progress listener"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
