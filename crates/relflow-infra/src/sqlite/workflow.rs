//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `relflow-core` using sqlx with split
//! read/write pools. Run inputs and node outputs are stored as JSON text. Every
//! write goes through the single-connection writer pool, so a write and the
//! existence check guarding it run inside one transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use relflow_core::repository::workflow::WorkflowRepository;
use relflow_types::error::RepositoryError;
use relflow_types::workflow::{
    ApprovalDecision, ApprovalOutcome, NodeKind, NodeRecord, NodeStatus, RunStatus, WorkflowRun,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

impl std::fmt::Debug for SqliteWorkflowRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteWorkflowRepository").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRunRow {
    id: String,
    definition_name: String,
    status: String,
    inputs: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl WorkflowRunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_name: row.try_get("definition_name")?,
            status: row.try_get("status")?,
            inputs: row.try_get("inputs")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let inputs = serde_json::from_str(&self.inputs)
            .map_err(|e| RepositoryError::Query(format!("invalid run inputs JSON: {e}")))?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            definition_name: self.definition_name,
            status,
            inputs,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct NodeRow {
    run_id: String,
    node: String,
    kind: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    output: Option<String>,
    retries_disabled: bool,
    started_at: Option<String>,
    finished_at: Option<String>,
    updated_at: String,
}

impl NodeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            node: row.try_get("node")?,
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            output: row.try_get("output")?,
            retries_disabled: row.try_get("retries_disabled")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<NodeRecord, RepositoryError> {
        let kind: NodeKind = self.kind.parse().map_err(RepositoryError::Query)?;
        let status: NodeStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid node output: {e}")))
            })
            .transpose()?;

        Ok(NodeRecord {
            run_id: parse_uuid(&self.run_id)?,
            node: self.node,
            kind,
            status,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| RepositoryError::Query(format!("invalid attempts: {}", self.attempts)))?,
            last_error: self.last_error,
            output,
            retries_disabled: self.retries_disabled,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct ApprovalRow {
    run_id: String,
    node: String,
    outcome: String,
    decided_by: String,
    reason: Option<String>,
    decided_at: String,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            node: row.try_get("node")?,
            outcome: row.try_get("outcome")?,
            decided_by: row.try_get("decided_by")?,
            reason: row.try_get("reason")?,
            decided_at: row.try_get("decided_at")?,
        })
    }

    fn into_decision(self) -> Result<ApprovalDecision, RepositoryError> {
        let outcome: ApprovalOutcome = self.outcome.parse().map_err(RepositoryError::Query)?;
        Ok(ApprovalDecision {
            run_id: parse_uuid(&self.run_id)?,
            node: self.node,
            outcome,
            decided_by: self.decided_by,
            reason: self.reason,
            decided_at: parse_datetime(&self.decided_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn to_json(value: &impl serde::Serialize) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

async fn run_exists(
    conn: &mut sqlx::SqliteConnection,
    run_id: &Uuid,
) -> Result<bool, RepositoryError> {
    let row = sqlx::query("SELECT 1 FROM workflow_runs WHERE id = ?")
        .bind(run_id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(query_error)?;
    Ok(row.is_some())
}

const NODE_COLUMNS: &str = "run_id, node, kind, status, attempts, last_error, output, \
                            retries_disabled, started_at, finished_at, updated_at";

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_run(
        &self,
        run: &WorkflowRun,
        nodes: &[NodeRecord],
    ) -> Result<(), RepositoryError> {
        let inputs = to_json(&run.inputs)?;
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, definition_name, status, inputs, error, created_at, updated_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(run.id.to_string())
        .bind(&run.definition_name)
        .bind(run.status.as_str())
        .bind(&inputs)
        .bind(&run.error)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.finished_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.id
            )));
        }

        for (position, node) in nodes.iter().enumerate() {
            let output = node.output.as_ref().map(to_json).transpose()?;
            sqlx::query(
                r#"INSERT INTO workflow_nodes
                   (run_id, node, position, kind, status, attempts, last_error, output,
                    retries_disabled, started_at, finished_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(run.id.to_string())
            .bind(&node.node)
            .bind(position as i64)
            .bind(node.kind.as_str())
            .bind(node.status.as_str())
            .bind(i64::from(node.attempts))
            .bind(&node.last_error)
            .bind(&output)
            .bind(node.retries_disabled)
            .bind(node.started_at.as_ref().map(format_datetime))
            .bind(node.finished_at.as_ref().map(format_datetime))
            .bind(format_datetime(&node.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = WorkflowRunRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        definition_name: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE definition_name = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(definition_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowRunRow::from_row(row).map_err(query_error)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status = 'running' ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowRunRow::from_row(row).map_err(query_error)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let finished_at = status.is_terminal().then(|| now.clone());

        let result = sqlx::query(
            "UPDATE workflow_runs SET status = ?, error = ?, updated_at = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&now)
        .bind(&finished_at)
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_node_record(&self, record: &NodeRecord) -> Result<(), RepositoryError> {
        let output = record.output.as_ref().map(to_json).transpose()?;
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        if !run_exists(&mut tx, &record.run_id).await? {
            return Err(RepositoryError::NotFound);
        }

        // New nodes go after the existing ones; updates keep their position.
        sqlx::query(
            r#"INSERT INTO workflow_nodes
               (run_id, node, position, kind, status, attempts, last_error, output,
                retries_disabled, started_at, finished_at, updated_at)
               VALUES (?1, ?2,
                       (SELECT COALESCE(MAX(position) + 1, 0) FROM workflow_nodes WHERE run_id = ?1),
                       ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
               ON CONFLICT(run_id, node) DO UPDATE SET
                 kind = excluded.kind,
                 status = excluded.status,
                 attempts = excluded.attempts,
                 last_error = excluded.last_error,
                 output = excluded.output,
                 retries_disabled = excluded.retries_disabled,
                 started_at = excluded.started_at,
                 finished_at = excluded.finished_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.node)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(i64::from(record.attempts))
        .bind(&record.last_error)
        .bind(&output)
        .bind(record.retries_disabled)
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(record.finished_at.as_ref().map(format_datetime))
        .bind(format_datetime(&record.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_node_record(
        &self,
        run_id: &Uuid,
        node: &str,
    ) -> Result<Option<NodeRecord>, RepositoryError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM workflow_nodes WHERE run_id = ? AND node = ?");
        let row = sqlx::query(&sql)
            .bind(run_id.to_string())
            .bind(node)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = NodeRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_node_records(&self, run_id: &Uuid) -> Result<Vec<NodeRecord>, RepositoryError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM workflow_nodes WHERE run_id = ? ORDER BY position ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = NodeRow::from_row(row).map_err(query_error)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn save_approval(&self, decision: &ApprovalDecision) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        if !run_exists(&mut tx, &decision.run_id).await? {
            return Err(RepositoryError::NotFound);
        }

        let result = sqlx::query(
            r#"INSERT INTO workflow_approvals
               (run_id, node, outcome, decided_by, reason, decided_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, node) DO NOTHING"#,
        )
        .bind(decision.run_id.to_string())
        .bind(&decision.node)
        .bind(decision.outcome.as_str())
        .bind(&decision.decided_by)
        .bind(&decision.reason)
        .bind(format_datetime(&decision.decided_at))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "node '{}' already has a decision",
                decision.node
            )));
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_approval(
        &self,
        run_id: &Uuid,
        node: &str,
    ) -> Result<Option<ApprovalDecision>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_approvals WHERE run_id = ? AND node = ?")
            .bind(run_id.to_string())
            .bind(node)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ApprovalRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_decision()?))
            }
            None => Ok(None),
        }
    }

    async fn delete_approval(&self, run_id: &Uuid, node: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_approvals WHERE run_id = ? AND node = ?")
            .bind(run_id.to_string())
            .bind(node)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_run(definition: &str) -> WorkflowRun {
        let now = Utc::now();
        WorkflowRun {
            id: Uuid::now_v7(),
            definition_name: definition.to_string(),
            status: RunStatus::Running,
            inputs: BTreeMap::from([
                ("version".to_string(), json!("v0.16.0")),
                ("reviewers".to_string(), json!(["alice", "bob"])),
            ]),
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn sample_nodes(run_id: Uuid) -> Vec<NodeRecord> {
        vec![
            NodeRecord::not_started(run_id, "next-version", NodeKind::Task),
            NodeRecord::not_started(run_id, "approve", NodeKind::Action),
            NodeRecord::not_started(run_id, "tag", NodeKind::Action),
        ]
    }

    async fn seeded() -> (SqliteWorkflowRepository, WorkflowRun) {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let run = sample_run("release-gopls");
        repo.create_run(&run, &sample_nodes(run.id)).await.unwrap();
        (repo, run)
    }

    // -- Runs --

    #[tokio::test]
    async fn test_create_and_get_run() {
        let (repo, run) = seeded().await;

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.definition_name, "release-gopls");
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.inputs, run.inputs);
        assert!(loaded.finished_at.is_none());

        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_run_conflicts() {
        let (repo, run) = seeded().await;
        let err = repo.create_run(&run, &[]).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // The rejected write left the original node set intact.
        assert_eq!(repo.list_node_records(&run.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_run_status_stamps_finished_at() {
        let (repo, run) = seeded().await;

        repo.update_run_status(&run.id, RunStatus::Failed, Some("node 'tag' failed"))
            .await
            .unwrap();
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("node 'tag' failed"));
        assert!(loaded.finished_at.is_some());

        repo.update_run_status(&run.id, RunStatus::Running, None)
            .await
            .unwrap();
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert!(loaded.finished_at.is_none());
        assert!(loaded.error.is_none());

        let err = repo
            .update_run_status(&Uuid::now_v7(), RunStatus::Cancelled, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_list_runs_newest_first_with_limit() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = sample_run("release-gopls");
            repo.create_run(&run, &[]).await.unwrap();
            ids.push(run.id);
        }
        let other = sample_run("release-vscode-go");
        repo.create_run(&other, &[]).await.unwrap();

        let runs = repo.list_runs("release-gopls", 2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, ids[2]);
        assert_eq!(runs[1].id, ids[1]);
    }

    #[tokio::test]
    async fn test_list_unfinished_runs() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let running = sample_run("release");
        let done = sample_run("release");
        repo.create_run(&running, &[]).await.unwrap();
        repo.create_run(&done, &[]).await.unwrap();
        repo.update_run_status(&done.id, RunStatus::Succeeded, None)
            .await
            .unwrap();

        let unfinished = repo.list_unfinished_runs().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, running.id);
    }

    // -- Nodes --

    #[tokio::test]
    async fn test_node_records_keep_definition_order() {
        let (repo, run) = seeded().await;
        let names: Vec<String> = repo
            .list_node_records(&run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.node)
            .collect();
        assert_eq!(names, vec!["next-version", "approve", "tag"]);
    }

    #[tokio::test]
    async fn test_save_node_record_upserts() {
        let (repo, run) = seeded().await;

        let mut record = repo
            .get_node_record(&run.id, "next-version")
            .await
            .unwrap()
            .unwrap();
        record.status = NodeStatus::Succeeded;
        record.attempts = 2;
        record.output = Some(json!({"version": "v0.16.1"}));
        record.retries_disabled = true;
        record.started_at = Some(Utc::now());
        record.finished_at = Some(Utc::now());
        repo.save_node_record(&record).await.unwrap();

        let loaded = repo
            .get_node_record(&run.id, "next-version")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, NodeStatus::Succeeded);
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.output, Some(json!({"version": "v0.16.1"})));
        assert!(loaded.retries_disabled);
        assert!(loaded.finished_at.is_some());

        let names: Vec<String> = repo
            .list_node_records(&run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.node)
            .collect();
        assert_eq!(names, vec!["next-version", "approve", "tag"]);
    }

    #[tokio::test]
    async fn test_save_node_record_for_unknown_run() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let record = NodeRecord::not_started(Uuid::now_v7(), "tag", NodeKind::Action);
        let err = repo.save_node_record(&record).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    // -- Approvals --

    #[tokio::test]
    async fn test_approval_saved_once() {
        let (repo, run) = seeded().await;
        let decision = ApprovalDecision {
            run_id: run.id,
            node: "approve".to_string(),
            outcome: ApprovalOutcome::Rejected,
            decided_by: "release-manager".to_string(),
            reason: Some("code freeze".to_string()),
            decided_at: Utc::now(),
        };
        repo.save_approval(&decision).await.unwrap();

        let loaded = repo.get_approval(&run.id, "approve").await.unwrap().unwrap();
        assert_eq!(loaded.outcome, ApprovalOutcome::Rejected);
        assert_eq!(loaded.reason.as_deref(), Some("code freeze"));

        let err = repo.save_approval(&decision).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(repo.get_approval(&run.id, "tag").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_approval_allows_new_decision() {
        let (repo, run) = seeded().await;
        let mut decision = ApprovalDecision {
            run_id: run.id,
            node: "approve".to_string(),
            outcome: ApprovalOutcome::Rejected,
            decided_by: "release-manager".to_string(),
            reason: Some("code freeze".to_string()),
            decided_at: Utc::now(),
        };
        repo.save_approval(&decision).await.unwrap();

        assert!(repo.delete_approval(&run.id, "approve").await.unwrap());
        assert!(!repo.delete_approval(&run.id, "approve").await.unwrap());
        assert!(repo.get_approval(&run.id, "approve").await.unwrap().is_none());

        decision.outcome = ApprovalOutcome::Approved;
        decision.reason = None;
        repo.save_approval(&decision).await.unwrap();
        let loaded = repo.get_approval(&run.id, "approve").await.unwrap().unwrap();
        assert!(loaded.is_approved());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("durable.db").display());

        let run = sample_run("release");
        {
            let pool = DatabasePool::new(&url).await.unwrap();
            let repo = SqliteWorkflowRepository::new(pool.clone());
            repo.create_run(&run, &sample_nodes(run.id)).await.unwrap();
            let mut record = NodeRecord::not_started(run.id, "next-version", NodeKind::Task);
            record.status = NodeStatus::Succeeded;
            record.attempts = 1;
            record.output = Some(json!("v1.0.0"));
            repo.save_node_record(&record).await.unwrap();
            pool.close().await;
        }

        let repo = SqliteWorkflowRepository::new(DatabasePool::new(&url).await.unwrap());
        let loaded = repo
            .get_node_record(&run.id, "next-version")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, NodeStatus::Succeeded);
        assert_eq!(loaded.output, Some(json!("v1.0.0")));
    }
}
