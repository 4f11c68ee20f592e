//! In-memory workflow repository.
//!
//! Process-local implementation of [`WorkflowRepository`] backed by `DashMap`.
//! Used by engine tests and by embedders that do not need restart durability.
//! Clones share the same underlying maps, so a clone handed to a second
//! engine sees everything the first one wrote (this is how the resume tests
//! simulate a restart).

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relflow_types::error::RepositoryError;
use relflow_types::workflow::{ApprovalDecision, NodeRecord, RunStatus, WorkflowRun};
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Default)]
struct Inner {
    runs: DashMap<Uuid, WorkflowRun>,
    /// Node records per run, kept in definition order.
    nodes: DashMap<Uuid, Vec<NodeRecord>>,
    approvals: DashMap<(Uuid, String), ApprovalDecision>,
}

/// `DashMap`-backed implementation of `WorkflowRepository`.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    inner: Arc<Inner>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs stored.
    pub fn run_count(&self) -> usize {
        self.inner.runs.len()
    }
}

impl std::fmt::Debug for InMemoryWorkflowRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWorkflowRepository")
            .field("runs", &self.inner.runs.len())
            .finish()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create_run(
        &self,
        run: &WorkflowRun,
        nodes: &[NodeRecord],
    ) -> Result<(), RepositoryError> {
        match self.inner.runs.entry(run.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.id
            ))),
            Entry::Vacant(slot) => {
                // Node records land before the run entry is released, so a
                // reader never sees a run without its nodes.
                self.inner.nodes.insert(run.id, nodes.to_vec());
                slot.insert(run.clone());
                Ok(())
            }
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.inner.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn list_runs(
        &self,
        definition_name: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .inner
            .runs
            .iter()
            .filter(|r| r.definition_name == definition_name)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .inner
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut run = self
            .inner
            .runs
            .get_mut(run_id)
            .ok_or(RepositoryError::NotFound)?;
        let now = Utc::now();
        run.status = status;
        run.error = error.map(str::to_string);
        run.updated_at = now;
        run.finished_at = status.is_terminal().then_some(now);
        Ok(())
    }

    async fn save_node_record(&self, record: &NodeRecord) -> Result<(), RepositoryError> {
        let mut nodes = self
            .inner
            .nodes
            .get_mut(&record.run_id)
            .ok_or(RepositoryError::NotFound)?;
        match nodes.iter_mut().find(|n| n.node == record.node) {
            Some(existing) => *existing = record.clone(),
            None => nodes.push(record.clone()),
        }
        Ok(())
    }

    async fn get_node_record(
        &self,
        run_id: &Uuid,
        node: &str,
    ) -> Result<Option<NodeRecord>, RepositoryError> {
        Ok(self
            .inner
            .nodes
            .get(run_id)
            .and_then(|nodes| nodes.iter().find(|n| n.node == node).cloned()))
    }

    async fn list_node_records(&self, run_id: &Uuid) -> Result<Vec<NodeRecord>, RepositoryError> {
        Ok(self
            .inner
            .nodes
            .get(run_id)
            .map(|nodes| nodes.value().clone())
            .unwrap_or_default())
    }

    async fn save_approval(&self, decision: &ApprovalDecision) -> Result<(), RepositoryError> {
        if !self.inner.runs.contains_key(&decision.run_id) {
            return Err(RepositoryError::NotFound);
        }
        match self
            .inner
            .approvals
            .entry((decision.run_id, decision.node.clone()))
        {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "node '{}' already has a decision",
                decision.node
            ))),
            Entry::Vacant(slot) => {
                slot.insert(decision.clone());
                Ok(())
            }
        }
    }

    async fn get_approval(
        &self,
        run_id: &Uuid,
        node: &str,
    ) -> Result<Option<ApprovalDecision>, RepositoryError> {
        Ok(self
            .inner
            .approvals
            .get(&(*run_id, node.to_string()))
            .map(|d| d.value().clone()))
    }

    async fn delete_approval(&self, run_id: &Uuid, node: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .inner
            .approvals
            .remove(&(*run_id, node.to_string()))
            .is_some())
    }
}
