//! Workflow execution records.
//!
//! A `WorkflowRun` is one execution of a named definition with concrete input
//! values. Each node of the definition has exactly one `NodeRecord` per run,
//! which the engine rewrites on every status transition. These are the rows
//! the durability store keeps, and the shape returned to UI polling.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the run has stopped (successfully or not).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Status of one node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    NotStarted,
    Running,
    Succeeded,
    /// The last attempt failed but the node may run again (automatically or on resume).
    FailedRetryable,
    /// The node will not run again unless it is explicitly reset.
    FailedTerminal,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::NotStarted => "not_started",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::FailedRetryable => "failed_retryable",
            NodeStatus::FailedTerminal => "failed_terminal",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(NodeStatus::NotStarted),
            "running" => Ok(NodeStatus::Running),
            "succeeded" => Ok(NodeStatus::Succeeded),
            "failed_retryable" => Ok(NodeStatus::FailedRetryable),
            "failed_terminal" => Ok(NodeStatus::FailedTerminal),
            other => Err(format!("invalid node status: '{other}'")),
        }
    }
}

/// Whether a node produces an output (Task) or exists only for its side effects (Action).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Action,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Task => "task",
            NodeKind::Action => "action",
        }
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(NodeKind::Task),
            "action" => Ok(NodeKind::Action),
            other => Err(format!("invalid node kind: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// A single execution instance of a workflow definition.
///
/// Created once by the engine at run start and retained for audit; it is
/// never deleted automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Name of the definition this run executes (used to look it up on resume).
    pub definition_name: String,
    /// Current run status.
    pub status: RunStatus,
    /// Validated input values, keyed by parameter name.
    pub inputs: BTreeMap<String, Value>,
    /// Failure summary when the run failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Node Record
// ---------------------------------------------------------------------------

/// Persisted execution state for one node within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub run_id: Uuid,
    /// Node name, unique within the definition.
    pub node: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// Number of attempts started since the node was last reset.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Serialized output; present only once a Task succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Set when the body opted out of automatic retry during its last attempt.
    #[serde(default)]
    pub retries_disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    /// A fresh record for a node that has not run yet.
    pub fn not_started(run_id: Uuid, node: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            run_id,
            node: node.into(),
            kind,
            status: NodeStatus::NotStarted,
            attempts: 0,
            last_error: None,
            output: None,
            retries_disabled: false,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Return the record to `NotStarted` with a zero attempt count.
    pub fn reset(&mut self) {
        self.status = NodeStatus::NotStarted;
        self.attempts = 0;
        self.last_error = None;
        self.output = None;
        self.retries_disabled = false;
        self.started_at = None;
        self.finished_at = None;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of a run and all of its node records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: WorkflowRun,
    pub nodes: Vec<NodeRecord>,
}

impl RunSnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node == name)
    }

    /// Number of nodes currently in `status`.
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
}

impl ApprovalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalOutcome::Approved => "approved",
            ApprovalOutcome::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(ApprovalOutcome::Approved),
            "rejected" => Ok(ApprovalOutcome::Rejected),
            other => Err(format!("invalid approval outcome: '{other}'")),
        }
    }
}

/// An operator's recorded decision for an approval gate node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub run_id: Uuid,
    pub node: String,
    pub outcome: ApprovalOutcome,
    pub decided_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        self.outcome == ApprovalOutcome::Approved
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_status_serializes_snake_case() {
        let v = serde_json::to_value(NodeStatus::FailedRetryable).unwrap();
        assert_eq!(v, json!("failed_retryable"));
        assert_eq!(NodeStatus::FailedRetryable.as_str(), "failed_retryable");
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            NodeStatus::NotStarted,
            NodeStatus::Running,
            NodeStatus::Succeeded,
            NodeStatus::FailedRetryable,
            NodeStatus::FailedTerminal,
        ] {
            assert_eq!(status.as_str().parse::<NodeStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn run_status_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn reset_clears_attempt_state() {
        let mut record = NodeRecord::not_started(Uuid::nil(), "tag", NodeKind::Action);
        record.status = NodeStatus::FailedTerminal;
        record.attempts = 3;
        record.last_error = Some("boom".to_string());
        record.retries_disabled = true;

        record.reset();

        assert_eq!(record.status, NodeStatus::NotStarted);
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
        assert!(!record.retries_disabled);
    }

    #[test]
    fn snapshot_lookup_and_count() {
        let run_id = Uuid::now_v7();
        let mut a = NodeRecord::not_started(run_id, "a", NodeKind::Task);
        a.status = NodeStatus::Succeeded;
        let b = NodeRecord::not_started(run_id, "b", NodeKind::Task);
        let snapshot = RunSnapshot {
            run: WorkflowRun {
                id: run_id,
                definition_name: "demo".to_string(),
                status: RunStatus::Running,
                inputs: BTreeMap::new(),
                error: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                finished_at: None,
            },
            nodes: vec![a, b],
        };

        assert_eq!(snapshot.count(NodeStatus::Succeeded), 1);
        assert_eq!(snapshot.count(NodeStatus::NotStarted), 1);
        assert!(snapshot.node("b").is_some());
        assert!(snapshot.node("c").is_none());
    }
}
