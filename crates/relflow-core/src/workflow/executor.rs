//! Workflow engine: event-driven parallel DAG execution with durable checkpointing.
//!
//! The `Engine` drives one run at a time per call to [`Engine::run`]. Every
//! runnable node is spawned onto a `tokio::task::JoinSet` as soon as its last
//! pending dependency succeeds; there is no wave barrier. Each node transition
//! is checkpointed before the engine reacts to it, which makes runs resumable
//! at node granularity after a crash.
//!
//! # Execution flow
//!
//! 1. `start` validates inputs and persists the run with every node `NotStarted`.
//! 2. `run` loads the node records, treats succeeded nodes as satisfied, and
//!    seeds the ready queue with nodes whose dependencies all succeeded.
//! 3. Launch: checkpoint `Running` -> emit `Started` -> spawn the attempt.
//! 4. On success: checkpoint output -> emit `Succeeded` -> unlock dependents.
//! 5. On failure: retry after backoff, or mark terminal and stop launching.
//! 6. When nothing is in flight, persist the run outcome and return.
//!
//! # Failure and cancellation
//!
//! After the first terminal failure the engine drains: attempts already in
//! flight run to completion and are recorded, but no node and no retry starts.
//! Cancellation signals every in-flight body through its `TaskContext`;
//! interrupted nodes are left `FailedRetryable` so the run can be resumed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use relflow_types::config::EngineConfig;
use relflow_types::event::{NodeEvent, NodeTransition};
use relflow_types::workflow::{
    NodeKind, NodeRecord, NodeStatus, RunSnapshot, RunStatus, WorkflowRun,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::TaskContext;
use super::definition::{
    AttemptTimeout, Definition, DefinitionError, InputSource, NodeBody, NodeId,
};
use super::listener::{GuardedListener, ProgressListener};
use super::param::ValidationError;
use super::registry::DefinitionRegistry;
use super::retry::{RetryDecision, RetryHandler, RetryPolicy};

/// Final output mapping of a successful run.
pub type RunOutputs = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid inputs: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("node '{node}' failed after {attempts} attempt(s): {error}")]
    NodeFailed {
        node: String,
        attempts: u32,
        error: String,
    },

    #[error("workflow run {0} was cancelled")]
    Cancelled(Uuid),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("no registered definition named '{0}'")]
    UnknownDefinition(String),

    #[error("workflow run {0} is already being executed")]
    RunAlreadyActive(Uuid),

    #[error("workflow run {run_id} already finished with status {status}")]
    RunFinished { run_id: Uuid, status: RunStatus },

    #[error("workflow run {run_id} stalled with unfinished nodes: {}", .pending.join(", "))]
    Stalled { run_id: Uuid, pending: Vec<String> },

    #[error("node '{node}' not found in run {run_id}")]
    NodeNotFound { run_id: Uuid, node: String },

    #[error("node '{node}' is {status} and cannot be retried")]
    InvalidNodeState { node: String, status: NodeStatus },

    #[error("stored run does not match definition: {0}")]
    DefinitionMismatch(String),

    #[error("node task failed to join: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// A started (or resumed) run bound to its definition.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: Uuid,
    definition: Definition,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }
}

// ---------------------------------------------------------------------------
// Attempt plumbing
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum AttemptError {
    Failed(String),
    TimedOut(Duration),
    Panicked(String),
    Cancelled,
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Failed(e) => f.write_str(e),
            AttemptError::TimedOut(d) => write!(f, "attempt timed out after {}s", d.as_secs_f64()),
            AttemptError::Panicked(msg) => write!(f, "node body panicked: {msg}"),
            AttemptError::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Something a spawned unit of work finished.
enum Completion {
    Attempt {
        id: NodeId,
        outcome: Result<Value, AttemptError>,
        retries_disabled: bool,
    },
    BackoffElapsed {
        id: NodeId,
    },
}

struct Attempt {
    id: NodeId,
    body: NodeBody,
    ctx: TaskContext,
    values: Vec<Value>,
    /// `None` lets the attempt run until it finishes or the run is cancelled.
    timeout: Option<Duration>,
    limiter: Option<Arc<Semaphore>>,
}

impl Attempt {
    async fn run(self) -> Completion {
        let Attempt {
            id,
            body,
            ctx,
            values,
            timeout,
            limiter,
        } = self;
        let token = ctx.cancellation_token().clone();

        let outcome = 'attempt: {
            let _permit = match limiter {
                Some(limiter) => tokio::select! {
                    biased;
                    _ = token.cancelled() => break 'attempt Err(AttemptError::Cancelled),
                    permit = limiter.acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            break 'attempt Err(AttemptError::Failed(
                                "concurrency limiter closed".to_string(),
                            ));
                        }
                    },
                },
                None => None,
            };

            // The closure runs inside the guard too: it may panic before
            // handing back its future.
            let body_ctx = ctx.clone();
            let body = AssertUnwindSafe(async move { body(body_ctx, values).await }).catch_unwind();
            let watched = async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, body)
                        .await
                        .map_err(|_| AttemptError::TimedOut(limit)),
                    None => Ok(body.await),
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(AttemptError::Cancelled),
                result = watched => match result {
                    Err(e) => Err(e),
                    Ok(Err(panic)) => Err(AttemptError::Panicked(panic_message(panic.as_ref()))),
                    Ok(Ok(Err(e))) => Err(AttemptError::Failed(format!("{e:#}"))),
                    Ok(Ok(Ok(value))) => Ok(value),
                },
            }
        };

        Completion::Attempt {
            id,
            outcome,
            retries_disabled: ctx.retries_disabled(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The first terminal failure of a run.
struct NodeFailure {
    node: String,
    attempts: u32,
    error: String,
}

/// Mutable scheduling state of one `run` call.
struct RunState {
    run: WorkflowRun,
    definition: Definition,
    listener: GuardedListener,
    /// Node records indexed by `NodeId`.
    records: Vec<NodeRecord>,
    /// Number of dependencies of each node that have not succeeded yet.
    pending_deps: Vec<usize>,
    ready: VecDeque<NodeId>,
    tasks: JoinSet<Completion>,
    /// Node each spawned task belongs to.
    task_nodes: HashMap<TaskId, NodeId>,
    /// Cancelled by `Engine::cancel`; observed by node bodies.
    cancel: CancellationToken,
    /// Child of `cancel`, also tripped by the first terminal failure. Stops
    /// pending backoff timers without touching bodies still in flight.
    stop: CancellationToken,
    failure: Option<NodeFailure>,
}

impl RunState {
    fn run_id(&self) -> Uuid {
        self.run.id
    }

    fn stopping(&self) -> bool {
        self.failure.is_some() || self.cancel.is_cancelled()
    }

    fn spawn<F>(&mut self, id: NodeId, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.task_nodes.insert(handle.id(), id);
    }

    /// Map a finished task back to a completion. A task that died without
    /// producing one counts as a failed attempt of its node.
    fn completion(
        &mut self,
        joined: Result<(TaskId, Completion), JoinError>,
    ) -> Result<Completion, EngineError> {
        match joined {
            Ok((task, completion)) => {
                self.task_nodes.remove(&task);
                Ok(completion)
            }
            Err(e) => {
                let message = e.to_string();
                let id = self
                    .task_nodes
                    .remove(&e.id())
                    .ok_or_else(|| EngineError::Join(message.clone()))?;
                tracing::error!(
                    run_id = %self.run.id,
                    node = %self.records[id].node,
                    error = %message,
                    "node task died"
                );
                let outcome = if e.is_panic() {
                    Err(AttemptError::Panicked(panic_message(e.into_panic().as_ref())))
                } else {
                    Err(AttemptError::Cancelled)
                };
                Ok(Completion::Attempt {
                    id,
                    outcome,
                    retries_disabled: false,
                })
            }
        }
    }

    fn emit(&self, id: NodeId, transition: NodeTransition) {
        let event = NodeEvent::new(self.run.id, self.records[id].node.clone(), transition);
        self.listener.transition(&event);
    }
}

/// Removes a run from the active set when `run` returns or is dropped.
struct ActiveRun<'a> {
    runs: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.runs.remove(&self.run_id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Event-driven DAG engine with durable checkpointing.
///
/// Generic over `R: WorkflowRepository` for storage flexibility. One engine
/// can drive many runs concurrently (one `run` call each).
pub struct Engine<R: WorkflowRepository> {
    checkpoint: CheckpointManager<R>,
    config: EngineConfig,
    default_policy: RetryPolicy,
    /// Shared cap on node bodies in flight, across runs.
    limiter: Option<Arc<Semaphore>>,
    /// Cancellation tokens keyed by run_id, present while `run` is executing.
    active_runs: DashMap<Uuid, CancellationToken>,
}

impl<R: WorkflowRepository> Engine<R> {
    pub fn new(repo: R, config: EngineConfig) -> Self {
        let limiter = config
            .max_concurrent_nodes
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            checkpoint: CheckpointManager::new(repo),
            default_policy: RetryPolicy::from_config(&config),
            config,
            limiter,
            active_runs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        self.checkpoint.repo()
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Validate `inputs` and persist a new run with every node `NotStarted`.
    ///
    /// Nothing is persisted when validation fails.
    pub async fn start(
        &self,
        definition: &Definition,
        inputs: HashMap<String, Value>,
    ) -> Result<RunHandle, EngineError> {
        let inputs = definition.validate_inputs(inputs)?;

        let now = Utc::now();
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            definition_name: definition.name().to_string(),
            status: RunStatus::Running,
            inputs,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        let nodes: Vec<NodeRecord> = definition
            .nodes()
            .iter()
            .map(|n| NodeRecord::not_started(run.id, n.name(), n.kind()))
            .collect();

        self.checkpoint.create_run(&run, &nodes).await?;

        tracing::info!(
            run_id = %run.id,
            definition = %definition.name(),
            nodes = nodes.len(),
            "workflow run created"
        );

        Ok(RunHandle {
            run_id: run.id,
            definition: definition.clone(),
        })
    }

    /// Drive a run to completion.
    ///
    /// Works for fresh and resumed runs alike: succeeded nodes are reused,
    /// nodes left `Running` or `FailedRetryable` start again from attempt 1.
    /// Calling `run` on a run that already succeeded returns its outputs.
    pub async fn run(
        &self,
        handle: &RunHandle,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<RunOutputs, EngineError> {
        let run_id = handle.run_id;
        let cancel = CancellationToken::new();
        match self.active_runs.entry(run_id) {
            Entry::Occupied(_) => return Err(EngineError::RunAlreadyActive(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }
        let _active = ActiveRun {
            runs: &self.active_runs,
            run_id,
        };

        let listener = GuardedListener::new(listener, self.config.slow_listener_threshold());
        self.drive(handle, listener, cancel).await
    }

    /// Prepare a stored run for another `run` call after a restart, a
    /// cancellation, or a manual `retry_node`.
    ///
    /// The definition is looked up by the run's stored name. Nodes left
    /// `Running` or `FailedRetryable` are reset to `NotStarted`; succeeded
    /// nodes keep their outputs; terminally failed nodes stay failed until
    /// `retry_node` resets them.
    pub async fn resume(
        &self,
        run_id: Uuid,
        registry: &DefinitionRegistry,
    ) -> Result<RunHandle, EngineError> {
        if self.active_runs.contains_key(&run_id) {
            return Err(EngineError::RunAlreadyActive(run_id));
        }

        let snapshot = self.load(run_id).await?;
        let definition = registry
            .get(&snapshot.run.definition_name)
            .ok_or_else(|| EngineError::UnknownDefinition(snapshot.run.definition_name.clone()))?;

        if snapshot.run.status == RunStatus::Succeeded {
            return Ok(RunHandle { run_id, definition });
        }

        let mut records = snapshot.nodes;
        let reset = self.reset_interrupted(&mut records).await?;

        if snapshot.run.status != RunStatus::Running {
            self.checkpoint
                .checkpoint_run_status(run_id, RunStatus::Running, None)
                .await?;
        }

        tracing::info!(
            run_id = %run_id,
            definition = %definition.name(),
            previous_status = %snapshot.run.status,
            reset_nodes = reset,
            "resuming workflow run"
        );

        Ok(RunHandle { run_id, definition })
    }

    /// Current run status and every node record, for polling and resumption.
    pub async fn query(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        self.load(run_id).await
    }

    /// Cancel a run.
    ///
    /// An executing run is signalled and winds down; its `run` call returns
    /// `EngineError::Cancelled`. A stored run that is not executing in this
    /// engine is marked cancelled directly.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        if let Some(token) = self.active_runs.get(&run_id) {
            token.cancel();
            tracing::info!(run_id = %run_id, "cancellation requested");
            return Ok(());
        }

        let snapshot = self.load(run_id).await?;
        if snapshot.run.status.is_terminal() {
            return Err(EngineError::RunFinished {
                run_id,
                status: snapshot.run.status,
            });
        }
        self.checkpoint
            .checkpoint_run_status(run_id, RunStatus::Cancelled, Some("cancelled"))
            .await?;
        tracing::info!(run_id = %run_id, "idle workflow run cancelled");
        Ok(())
    }

    /// Reset a failed node to `NotStarted` so the next `resume` + `run`
    /// executes it again from attempt 1.
    ///
    /// This is the manual retry path for nodes that disabled automatic retry.
    /// A rejected approval gate also loses its stored rejection, so the gate
    /// parks again and waits for a new decision.
    pub async fn retry_node(&self, run_id: Uuid, node: &str) -> Result<(), EngineError> {
        if self.active_runs.contains_key(&run_id) {
            return Err(EngineError::RunAlreadyActive(run_id));
        }

        let snapshot = self.load(run_id).await?;
        let mut record = snapshot
            .node(node)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound {
                run_id,
                node: node.to_string(),
            })?;

        if !matches!(
            record.status,
            NodeStatus::FailedTerminal | NodeStatus::FailedRetryable
        ) {
            return Err(EngineError::InvalidNodeState {
                node: node.to_string(),
                status: record.status,
            });
        }

        let repo = self.checkpoint.repo();
        let rejected = repo
            .get_approval(&run_id, node)
            .await
            .map_err(|e| EngineError::Checkpoint(CheckpointError::Repository(e.to_string())))?
            .is_some_and(|decision| !decision.is_approved());
        if rejected {
            repo.delete_approval(&run_id, node)
                .await
                .map_err(|e| EngineError::Checkpoint(CheckpointError::Repository(e.to_string())))?;
            tracing::info!(run_id = %run_id, node, "rejected approval cleared");
        }

        self.checkpoint.checkpoint_node_reset(&mut record).await?;
        tracing::info!(run_id = %run_id, node, "node reset for manual retry");
        Ok(())
    }

    /// Runs left in `Running`, oldest first (crash recovery discovery).
    pub async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, EngineError> {
        self.checkpoint
            .repo()
            .list_unfinished_runs()
            .await
            .map_err(|e| EngineError::Checkpoint(CheckpointError::Repository(e.to_string())))
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        handle: &RunHandle,
        listener: GuardedListener,
        cancel: CancellationToken,
    ) -> Result<RunOutputs, EngineError> {
        let definition = handle.definition.clone();
        let snapshot = self.load(handle.run_id).await?;

        if snapshot.run.definition_name != definition.name() {
            return Err(EngineError::DefinitionMismatch(format!(
                "run uses '{}', handle carries '{}'",
                snapshot.run.definition_name,
                definition.name()
            )));
        }

        match snapshot.run.status {
            RunStatus::Running => {}
            RunStatus::Succeeded => {
                let records = align_records(&definition, snapshot.nodes)?;
                let outputs: Vec<Option<Value>> =
                    records.into_iter().map(|r| r.output).collect();
                return Ok(collect_outputs(&definition, &outputs));
            }
            status => {
                return Err(EngineError::RunFinished {
                    run_id: handle.run_id,
                    status,
                });
            }
        }

        let mut records = align_records(&definition, snapshot.nodes)?;
        self.reset_interrupted(&mut records).await?;

        let stop = cancel.child_token();
        let mut state = RunState {
            run: snapshot.run,
            definition: definition.clone(),
            listener,
            pending_deps: vec![0; records.len()],
            records,
            ready: VecDeque::new(),
            tasks: JoinSet::new(),
            task_nodes: HashMap::new(),
            cancel,
            stop,
            failure: None,
        };

        for id in 0..state.records.len() {
            state.pending_deps[id] = definition
                .dependencies_of(id)
                .into_iter()
                .filter(|dep| state.records[*dep].status != NodeStatus::Succeeded)
                .count();

            let record = &state.records[id];
            if record.status == NodeStatus::FailedTerminal && state.failure.is_none() {
                state.failure = Some(NodeFailure {
                    node: record.node.clone(),
                    attempts: record.attempts,
                    error: record.last_error.clone().unwrap_or_default(),
                });
            }
            if record.status == NodeStatus::NotStarted && state.pending_deps[id] == 0 {
                state.ready.push_back(id);
            }
        }

        tracing::info!(
            run_id = %state.run_id(),
            definition = %definition.name(),
            nodes = state.records.len(),
            ready = state.ready.len(),
            "starting workflow execution"
        );
        state.listener.run_started(state.run_id(), definition.name());

        loop {
            if !state.stopping() {
                while let Some(id) = state.ready.pop_front() {
                    self.launch(&mut state, id).await?;
                }
            }

            if state.tasks.is_empty() {
                break;
            }

            let cancelled = state.cancel.clone();
            tokio::select! {
                biased;
                _ = cancelled.cancelled(), if !cancelled.is_cancelled() => {
                    tracing::info!(run_id = %state.run_id(), in_flight = state.tasks.len(), "workflow run cancelling");
                }
                joined = state.tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let completion = state.completion(joined)?;
                    self.handle_completion(&mut state, completion).await?;
                }
            }
        }

        self.finish(state).await
    }

    /// Checkpoint `Running`, emit `Started`, and spawn one attempt.
    async fn launch(&self, state: &mut RunState, id: NodeId) -> Result<(), EngineError> {
        let definition = state.definition.clone();
        let spec = definition
            .node(id)
            .ok_or_else(|| EngineError::DefinitionMismatch(format!("node #{id}")))?;

        let mut values = Vec::with_capacity(spec.inputs().len());
        for input in spec.inputs() {
            let value = match input {
                InputSource::Param(name) => state.run.inputs.get(name).cloned().ok_or_else(|| {
                    EngineError::DefinitionMismatch(format!("run has no input '{name}'"))
                })?,
                InputSource::Node(dep) => state.records[*dep].output.clone().ok_or_else(|| {
                    EngineError::DefinitionMismatch(format!(
                        "node '{}' has no stored output",
                        state.records[*dep].node
                    ))
                })?,
            };
            values.push(value);
        }

        self.checkpoint
            .checkpoint_node_started(&mut state.records[id])
            .await?;
        let attempt = state.records[id].attempts;
        state.emit(id, NodeTransition::Started { attempt });

        tracing::debug!(
            run_id = %state.run_id(),
            node = spec.name(),
            attempt,
            "node attempt started"
        );

        let ctx = TaskContext::new(
            state.run_id(),
            definition.name(),
            spec.name(),
            attempt,
            state.cancel.child_token(),
            Some(state.listener.clone()),
        );
        let work = Attempt {
            id,
            body: Arc::clone(&spec.body),
            ctx,
            values,
            timeout: match spec.attempt_timeout() {
                AttemptTimeout::EngineDefault => Some(self.config.attempt_timeout()),
                AttemptTimeout::After(limit) => Some(limit),
                AttemptTimeout::Unbounded => None,
            },
            limiter: self.limiter.clone(),
        };
        state.spawn(id, work.run());
        Ok(())
    }

    async fn handle_completion(
        &self,
        state: &mut RunState,
        completion: Completion,
    ) -> Result<(), EngineError> {
        match completion {
            Completion::BackoffElapsed { id } => {
                if state.stopping() {
                    tracing::debug!(
                        run_id = %state.run_id(),
                        node = %state.records[id].node,
                        "retry skipped, run is stopping"
                    );
                } else {
                    self.launch(state, id).await?;
                }
                Ok(())
            }
            Completion::Attempt {
                id,
                outcome: Ok(value),
                retries_disabled,
            } => self.on_success(state, id, value, retries_disabled).await,
            Completion::Attempt {
                id,
                outcome: Err(error),
                retries_disabled,
            } => self.on_failure(state, id, error, retries_disabled).await,
        }
    }

    async fn on_success(
        &self,
        state: &mut RunState,
        id: NodeId,
        value: Value,
        retries_disabled: bool,
    ) -> Result<(), EngineError> {
        let output = match state.records[id].kind {
            NodeKind::Task => Some(value),
            NodeKind::Action => None,
        };
        self.checkpoint
            .checkpoint_node_succeeded(&mut state.records[id], output.clone(), retries_disabled)
            .await?;

        let attempt = state.records[id].attempts;
        state.emit(id, NodeTransition::Succeeded { attempt, output });
        tracing::debug!(
            run_id = %state.run_id(),
            node = %state.records[id].node,
            attempt,
            "node succeeded"
        );

        for dependent in state.definition.dependents_of(id) {
            state.pending_deps[dependent] = state.pending_deps[dependent].saturating_sub(1);
            if state.pending_deps[dependent] == 0
                && state.records[dependent].status == NodeStatus::NotStarted
            {
                state.ready.push_back(dependent);
            }
        }
        Ok(())
    }

    async fn on_failure(
        &self,
        state: &mut RunState,
        id: NodeId,
        error: AttemptError,
        retries_disabled: bool,
    ) -> Result<(), EngineError> {
        let attempt = state.records[id].attempts;
        let message = error.to_string();

        if matches!(error, AttemptError::Cancelled) {
            self.checkpoint
                .checkpoint_node_failed(
                    &mut state.records[id],
                    NodeStatus::FailedRetryable,
                    &message,
                    retries_disabled,
                )
                .await?;
            state.emit(
                id,
                NodeTransition::Interrupted {
                    attempt,
                    reason: message,
                },
            );
            return Ok(());
        }

        let policy = state
            .definition
            .node(id)
            .and_then(|spec| spec.retry_policy())
            .unwrap_or(&self.default_policy)
            .clone();

        match RetryHandler::decide(&policy, attempt, retries_disabled) {
            RetryDecision::Retry { backoff } => {
                self.checkpoint
                    .checkpoint_node_failed(
                        &mut state.records[id],
                        NodeStatus::FailedRetryable,
                        &message,
                        retries_disabled,
                    )
                    .await?;

                if state.stopping() {
                    tracing::warn!(
                        run_id = %state.run_id(),
                        node = %state.records[id].node,
                        attempt,
                        error = %message,
                        "node failed while run is stopping, left for resume"
                    );
                    state.emit(
                        id,
                        NodeTransition::Interrupted {
                            attempt,
                            reason: message,
                        },
                    );
                    return Ok(());
                }

                tracing::warn!(
                    run_id = %state.run_id(),
                    node = %state.records[id].node,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %message,
                    "node attempt failed, retrying"
                );
                state.emit(
                    id,
                    NodeTransition::Retrying {
                        attempt,
                        error: message,
                        backoff_ms: backoff.as_millis() as u64,
                    },
                );

                let stop = state.stop.clone();
                state.spawn(id, async move {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop.cancelled() => {}
                    }
                    Completion::BackoffElapsed { id }
                });
                Ok(())
            }
            decision => {
                self.checkpoint
                    .checkpoint_node_failed(
                        &mut state.records[id],
                        NodeStatus::FailedTerminal,
                        &message,
                        retries_disabled,
                    )
                    .await?;

                let node = state.records[id].node.clone();
                tracing::error!(
                    run_id = %state.run_id(),
                    node = %node,
                    attempt,
                    retries_disabled = matches!(decision, RetryDecision::RetriesDisabled),
                    error = %message,
                    "node failed terminally"
                );
                state.emit(
                    id,
                    NodeTransition::Failed {
                        attempt,
                        error: message.clone(),
                    },
                );

                if state.failure.is_none() {
                    state.failure = Some(NodeFailure {
                        node,
                        attempts: attempt,
                        error: message,
                    });
                    state.stop.cancel();
                }
                Ok(())
            }
        }
    }

    /// Persist the run outcome and notify the listener.
    async fn finish(&self, state: RunState) -> Result<RunOutputs, EngineError> {
        let run_id = state.run_id();

        let (status, result) = if let Some(failure) = state.failure {
            (
                RunStatus::Failed,
                Err(EngineError::NodeFailed {
                    node: failure.node,
                    attempts: failure.attempts,
                    error: failure.error,
                }),
            )
        } else if state.cancel.is_cancelled() {
            (RunStatus::Cancelled, Err(EngineError::Cancelled(run_id)))
        } else if state
            .records
            .iter()
            .all(|r| r.status == NodeStatus::Succeeded)
        {
            let outputs: Vec<Option<Value>> =
                state.records.iter().map(|r| r.output.clone()).collect();
            (
                RunStatus::Succeeded,
                Ok(collect_outputs(&state.definition, &outputs)),
            )
        } else {
            let pending = state
                .records
                .iter()
                .filter(|r| r.status != NodeStatus::Succeeded)
                .map(|r| r.node.clone())
                .collect();
            (RunStatus::Failed, Err(EngineError::Stalled { run_id, pending }))
        };

        let error = result.as_ref().err().map(|e| e.to_string());
        self.checkpoint
            .checkpoint_run_status(run_id, status, error.as_deref())
            .await?;
        state.listener.run_finished(run_id, status, error.as_deref());

        match &error {
            None => tracing::info!(run_id = %run_id, status = %status, "workflow run finished"),
            Some(error) => {
                tracing::warn!(run_id = %run_id, status = %status, error = %error, "workflow run finished")
            }
        }

        result
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        match self.checkpoint.load_run(run_id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(CheckpointError::RunNotFound(id)) => Err(EngineError::RunNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Reset records left mid-flight by a crash, cancellation, or drain.
    async fn reset_interrupted(&self, records: &mut [NodeRecord]) -> Result<usize, EngineError> {
        let mut reset = 0;
        for record in records.iter_mut() {
            if matches!(
                record.status,
                NodeStatus::Running | NodeStatus::FailedRetryable
            ) {
                tracing::debug!(
                    run_id = %record.run_id,
                    node = %record.node,
                    status = %record.status,
                    attempts = record.attempts,
                    "resetting interrupted node"
                );
                self.checkpoint.checkpoint_node_reset(record).await?;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

impl<R: WorkflowRepository> std::fmt::Debug for Engine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("active_runs", &self.active_runs.len())
            .finish()
    }
}

/// Order stored records by `NodeId`, checking they match the definition.
fn align_records(
    definition: &Definition,
    stored: Vec<NodeRecord>,
) -> Result<Vec<NodeRecord>, EngineError> {
    let mut by_name: HashMap<String, NodeRecord> =
        stored.into_iter().map(|r| (r.node.clone(), r)).collect();

    let mut records = Vec::with_capacity(definition.nodes().len());
    for spec in definition.nodes() {
        let record = by_name.remove(spec.name()).ok_or_else(|| {
            EngineError::DefinitionMismatch(format!("no stored record for node '{}'", spec.name()))
        })?;
        records.push(record);
    }

    if let Some(extra) = by_name.into_keys().min() {
        return Err(EngineError::DefinitionMismatch(format!(
            "stored node '{extra}' is not in definition '{}'",
            definition.name()
        )));
    }
    Ok(records)
}

/// Declared outputs, or every Task output by node name when none are declared.
fn collect_outputs(definition: &Definition, outputs: &[Option<Value>]) -> RunOutputs {
    let value_of = |id: NodeId| outputs.get(id).cloned().flatten().unwrap_or(Value::Null);

    if definition.outputs().is_empty() {
        definition
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.kind() == NodeKind::Task)
            .map(|(id, spec)| (spec.name().to_string(), value_of(id)))
            .collect()
    } else {
        definition
            .outputs()
            .iter()
            .map(|(name, id)| (name.clone(), value_of(*id)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
