//! Per-attempt context handed to node bodies.
//!
//! Gives a body its identity (run, node, attempt), the run-wide cancellation
//! signal, structured logging routed to the run's progress listener, and the
//! hook to opt out of automatic retry before a non-idempotent side effect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::listener::GuardedListener;

struct ContextInner {
    run_id: Uuid,
    definition: String,
    node: String,
    attempt: u32,
    cancel: CancellationToken,
    retries_disabled: AtomicBool,
    listener: Option<GuardedListener>,
}

/// Context for one attempt of one node. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    pub(crate) fn new(
        run_id: Uuid,
        definition: &str,
        node: &str,
        attempt: u32,
        cancel: CancellationToken,
        listener: Option<GuardedListener>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run_id,
                definition: definition.to_string(),
                node: node.to_string(),
                attempt,
                cancel,
                retries_disabled: AtomicBool::new(false),
                listener,
            }),
        }
    }

    /// A context outside any engine, for unit-testing node bodies directly.
    pub fn standalone(node: &str) -> Self {
        Self::new(Uuid::nil(), "standalone", node, 1, CancellationToken::new(), None)
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// Name of the definition the run executes.
    pub fn definition(&self) -> &str {
        &self.inner.definition
    }

    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// 1-based attempt number since the node was last reset.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Opt this attempt out of automatic retry.
    ///
    /// Call before a side effect that must not be repeated blindly. If the
    /// attempt then fails, the node fails terminally and has to be retried
    /// manually.
    pub fn disable_retries(&self) {
        self.inner.retries_disabled.store(true, Ordering::SeqCst);
        tracing::debug!(
            run_id = %self.inner.run_id,
            node = %self.inner.node,
            attempt = self.inner.attempt,
            "automatic retry disabled"
        );
    }

    pub fn retries_disabled(&self) -> bool {
        self.inner.retries_disabled.load(Ordering::SeqCst)
    }

    /// Structured log line for this attempt, also forwarded to the listener.
    pub fn log(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::info!(
            run_id = %self.inner.run_id,
            node = %self.inner.node,
            attempt = self.inner.attempt,
            "{line}"
        );
        if let Some(listener) = &self.inner.listener {
            listener.log(self.inner.run_id, &self.inner.node, line);
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("run_id", &self.inner.run_id)
            .field("node", &self.inner.node)
            .field("attempt", &self.inner.attempt)
            .finish()
    }
}
