//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow runs, per-node execution
//! records and approval decisions. The infrastructure layer (relflow-infra)
//! implements this trait with SQLite persistence; [`InMemoryWorkflowRepository`]
//! implements it for tests and embedding.
//!
//! [`InMemoryWorkflowRepository`]: super::memory::InMemoryWorkflowRepository

use relflow_types::error::RepositoryError;
use relflow_types::workflow::{ApprovalDecision, NodeRecord, RunStatus, WorkflowRun};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Runs:** create/update/query workflow execution instances.
/// - **Nodes:** one record per `(run_id, node)`, rewritten on every transition.
/// - **Approvals:** operator decisions for approval gate nodes.
///
/// Every write must be atomic and readable after a restart. Uses native async
/// fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a run together with its initial node records in one atomic write.
    ///
    /// Fails with [`RepositoryError::Conflict`] if the run ID already exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
        nodes: &[NodeRecord],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs of a definition, newest first.
    fn list_runs(
        &self,
        definition_name: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// List runs that were left in `Running` status (crash recovery).
    fn list_unfinished_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Update a run's status and error summary.
    ///
    /// Terminal statuses stamp `finished_at`; `Running` clears it.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Insert or replace the record for `(record.run_id, record.node)`.
    fn save_node_record(
        &self,
        record: &NodeRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_node_record(
        &self,
        run_id: &Uuid,
        node: &str,
    ) -> impl std::future::Future<Output = Result<Option<NodeRecord>, RepositoryError>> + Send;

    /// All node records of a run, in definition order.
    fn list_node_records(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// Record a decision. A second decision for the same node is rejected
    /// with [`RepositoryError::Conflict`].
    fn save_approval(
        &self,
        decision: &ApprovalDecision,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_approval(
        &self,
        run_id: &Uuid,
        node: &str,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalDecision>, RepositoryError>> + Send;

    /// Forget the decision for a gate so it can be decided again.
    ///
    /// Returns whether a decision existed.
    fn delete_approval(
        &self,
        run_id: &Uuid,
        node: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
