//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps `WorkflowRepository` to provide a higher-level API for recording
//! node-level execution checkpoints. Each node transition (not started ->
//! running -> succeeded/failed) is persisted before the engine moves on, so a
//! crashed run can resume without re-running any node whose output was saved.

use chrono::Utc;
use relflow_types::workflow::{NodeRecord, NodeStatus, RunSnapshot, RunStatus, WorkflowRun};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow runs.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory, etc.). The node-level methods take the engine's copy of
/// the record, persist the updated version, and only then apply it in memory,
/// so the engine never acts on a transition the store did not accept.
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Persist a new run with its initial node records.
    pub async fn create_run(
        &self,
        run: &WorkflowRun,
        nodes: &[NodeRecord],
    ) -> Result<(), CheckpointError> {
        self.repo
            .create_run(run, nodes)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(run_id = %run.id, nodes = nodes.len(), "checkpointed run creation");
        Ok(())
    }

    /// Update the overall run status.
    pub async fn checkpoint_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), CheckpointError> {
        self.repo
            .update_run_status(&run_id, status, error)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(run_id = %run_id, status = %status, "checkpointed run status");
        Ok(())
    }

    /// Load a run and all of its node records.
    pub async fn load_run(&self, run_id: Uuid) -> Result<RunSnapshot, CheckpointError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))?;

        let nodes = self
            .repo
            .list_node_records(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        Ok(RunSnapshot { run, nodes })
    }

    // -----------------------------------------------------------------------
    // Node-level checkpoints
    // -----------------------------------------------------------------------

    /// Checkpoint a node as starting a new attempt (-> Running, attempts + 1).
    pub async fn checkpoint_node_started(
        &self,
        record: &mut NodeRecord,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let mut next = record.clone();
        next.status = NodeStatus::Running;
        next.attempts += 1;
        next.last_error = None;
        next.output = None;
        next.retries_disabled = false;
        next.started_at = Some(now);
        next.finished_at = None;
        next.updated_at = now;

        self.persist(record, next).await?;
        tracing::debug!(
            run_id = %record.run_id,
            node = %record.node,
            attempt = record.attempts,
            "checkpointed node start"
        );
        Ok(())
    }

    /// Checkpoint a node as succeeded with its serialized output.
    pub async fn checkpoint_node_succeeded(
        &self,
        record: &mut NodeRecord,
        output: Option<Value>,
        retries_disabled: bool,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let mut next = record.clone();
        next.status = NodeStatus::Succeeded;
        next.output = output;
        next.last_error = None;
        next.retries_disabled = retries_disabled;
        next.finished_at = Some(now);
        next.updated_at = now;

        self.persist(record, next).await?;
        tracing::debug!(run_id = %record.run_id, node = %record.node, "checkpointed node success");
        Ok(())
    }

    /// Checkpoint a failed attempt as retryable or terminal.
    pub async fn checkpoint_node_failed(
        &self,
        record: &mut NodeRecord,
        status: NodeStatus,
        error: &str,
        retries_disabled: bool,
    ) -> Result<(), CheckpointError> {
        debug_assert!(matches!(
            status,
            NodeStatus::FailedRetryable | NodeStatus::FailedTerminal
        ));
        let now = Utc::now();
        let mut next = record.clone();
        next.status = status;
        next.last_error = Some(error.to_string());
        next.output = None;
        next.retries_disabled = retries_disabled;
        next.finished_at = Some(now);
        next.updated_at = now;

        self.persist(record, next).await?;
        tracing::debug!(
            run_id = %record.run_id,
            node = %record.node,
            status = %status,
            error,
            "checkpointed node failure"
        );
        Ok(())
    }

    /// Return a node to NotStarted with a zero attempt count.
    pub async fn checkpoint_node_reset(
        &self,
        record: &mut NodeRecord,
    ) -> Result<(), CheckpointError> {
        let mut next = record.clone();
        next.reset();

        self.persist(record, next).await?;
        tracing::debug!(run_id = %record.run_id, node = %record.node, "checkpointed node reset");
        Ok(())
    }

    async fn persist(&self, record: &mut NodeRecord, next: NodeRecord) -> Result<(), CheckpointError> {
        self.repo
            .save_node_record(&next)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        *record = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use relflow_types::workflow::NodeKind;
    use std::collections::BTreeMap;

    async fn setup() -> (CheckpointManager<InMemoryWorkflowRepository>, Uuid, NodeRecord) {
        let repo = InMemoryWorkflowRepository::new();
        let now = Utc::now();
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            definition_name: "release".to_string(),
            status: RunStatus::Running,
            inputs: BTreeMap::new(),
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        let record = NodeRecord::not_started(run.id, "tag", NodeKind::Task);
        let manager = CheckpointManager::new(repo);
        manager
            .create_run(&run, std::slice::from_ref(&record))
            .await
            .unwrap();
        (manager, run.id, record)
    }

    #[tokio::test]
    async fn node_lifecycle_is_persisted() {
        let (manager, run_id, mut record) = setup().await;

        manager.checkpoint_node_started(&mut record).await.unwrap();
        assert_eq!(record.attempts, 1);
        let stored = manager.repo().get_node_record(&run_id, "tag").await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Running);

        manager
            .checkpoint_node_failed(&mut record, NodeStatus::FailedRetryable, "503", false)
            .await
            .unwrap();
        manager.checkpoint_node_started(&mut record).await.unwrap();
        assert_eq!(record.attempts, 2);
        assert!(record.last_error.is_none());

        manager
            .checkpoint_node_succeeded(&mut record, Some(serde_json::json!("v1.0.0")), true)
            .await
            .unwrap();
        let stored = manager.repo().get_node_record(&run_id, "tag").await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Succeeded);
        assert_eq!(stored.attempts, 2);
        assert!(stored.retries_disabled);
        assert_eq!(stored.output, Some(serde_json::json!("v1.0.0")));
    }

    #[tokio::test]
    async fn reset_returns_to_not_started() {
        let (manager, run_id, mut record) = setup().await;
        manager.checkpoint_node_started(&mut record).await.unwrap();
        manager
            .checkpoint_node_failed(&mut record, NodeStatus::FailedTerminal, "boom", true)
            .await
            .unwrap();

        manager.checkpoint_node_reset(&mut record).await.unwrap();

        let snapshot = manager.load_run(run_id).await.unwrap();
        let stored = snapshot.node("tag").unwrap();
        assert_eq!(stored.status, NodeStatus::NotStarted);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn failed_persist_leaves_record_untouched() {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let mut record = NodeRecord::not_started(Uuid::now_v7(), "orphan", NodeKind::Task);

        let err = manager.checkpoint_node_started(&mut record).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Repository(_)));
        assert_eq!(record.status, NodeStatus::NotStarted);
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn load_missing_run_is_not_found() {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let id = Uuid::now_v7();
        assert!(matches!(
            manager.load_run(id).await,
            Err(CheckpointError::RunNotFound(missing)) if missing == id
        ));
    }
}
