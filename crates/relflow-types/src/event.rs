//! Workflow progress events.
//!
//! Emitted by the engine on every node transition and delivered to the run's
//! progress listener. The same shapes are broadcast over the event bus for
//! UI subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{NodeStatus, RunStatus};

/// What happened to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeTransition {
    Started {
        attempt: u32,
    },
    Succeeded {
        attempt: u32,
        /// Output of a Task; `None` for Actions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    /// The attempt failed and another attempt is scheduled after `backoff_ms`.
    Retrying {
        attempt: u32,
        error: String,
        backoff_ms: u64,
    },
    /// The node failed terminally.
    Failed {
        attempt: u32,
        error: String,
    },
    /// The attempt was stopped by cancellation or drained after a sibling
    /// failure. The node stays eligible for resume.
    Interrupted {
        attempt: u32,
        reason: String,
    },
}

impl NodeTransition {
    /// Node status the transition leaves behind.
    pub fn status(&self) -> NodeStatus {
        match self {
            NodeTransition::Started { .. } => NodeStatus::Running,
            NodeTransition::Succeeded { .. } => NodeStatus::Succeeded,
            NodeTransition::Retrying { .. } | NodeTransition::Interrupted { .. } => {
                NodeStatus::FailedRetryable
            }
            NodeTransition::Failed { .. } => NodeStatus::FailedTerminal,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            NodeTransition::Started { attempt }
            | NodeTransition::Succeeded { attempt, .. }
            | NodeTransition::Retrying { attempt, .. }
            | NodeTransition::Failed { attempt, .. }
            | NodeTransition::Interrupted { attempt, .. } => *attempt,
        }
    }

    /// Error or reason text carried by failure transitions.
    pub fn error(&self) -> Option<&str> {
        match self {
            NodeTransition::Retrying { error, .. } | NodeTransition::Failed { error, .. } => {
                Some(error)
            }
            NodeTransition::Interrupted { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// A single node state change within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub run_id: Uuid,
    pub node: String,
    pub transition: NodeTransition,
    pub at: DateTime<Utc>,
}

impl NodeEvent {
    pub fn new(run_id: Uuid, node: impl Into<String>, transition: NodeTransition) -> Self {
        Self {
            run_id,
            node: node.into(),
            transition,
            at: Utc::now(),
        }
    }
}

/// Events broadcast to bus subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        definition: String,
    },
    Node(NodeEvent),
    Log {
        run_id: Uuid,
        node: String,
        line: String,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::Log { run_id, .. }
            | WorkflowEvent::RunFinished { run_id, .. } => *run_id,
            WorkflowEvent::Node(event) => event.run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transition_maps_to_status() {
        assert_eq!(
            NodeTransition::Started { attempt: 1 }.status(),
            NodeStatus::Running
        );
        assert_eq!(
            NodeTransition::Retrying {
                attempt: 1,
                error: "503".into(),
                backoff_ms: 1000
            }
            .status(),
            NodeStatus::FailedRetryable
        );
        assert_eq!(
            NodeTransition::Failed {
                attempt: 3,
                error: "503".into()
            }
            .status(),
            NodeStatus::FailedTerminal
        );
    }

    #[test]
    fn node_event_serializes_tagged() {
        let event = WorkflowEvent::Node(NodeEvent::new(
            Uuid::nil(),
            "tag",
            NodeTransition::Succeeded {
                attempt: 2,
                output: Some(json!("v0.1.0")),
            },
        ));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node");
        assert_eq!(value["transition"]["type"], "succeeded");
        assert_eq!(value["transition"]["output"], "v0.1.0");
        assert_eq!(event.run_id(), Uuid::nil());
    }
}
