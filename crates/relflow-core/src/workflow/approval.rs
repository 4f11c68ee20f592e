//! Approval gates: Action bodies that park until an operator decides.
//!
//! The broker persists every decision before waking the waiting body, so a
//! decision recorded while the process was down is found on resume. Waiters
//! subscribe to a `tokio::sync::watch` channel keyed by `(run_id, node)` and
//! only then consult the store, which closes the race with a concurrent
//! `approve` call.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use relflow_types::error::RepositoryError;
use relflow_types::workflow::{ApprovalDecision, ApprovalOutcome};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::context::TaskContext;

type DecisionSender = watch::Sender<Option<ApprovalDecision>>;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("node '{node}' not found in run {run_id}")]
    NodeNotFound { run_id: Uuid, node: String },

    #[error("node '{node}' was already {}", .outcome.as_str())]
    AlreadyDecided {
        node: String,
        outcome: ApprovalOutcome,
    },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Records approval decisions and wakes the gates waiting on them.
pub struct ApprovalBroker<R: WorkflowRepository> {
    repo: R,
    channels: DashMap<(Uuid, String), DecisionSender>,
}

impl<R: WorkflowRepository + 'static> ApprovalBroker<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            channels: DashMap::new(),
        }
    }

    /// Block the calling node body until a decision for it is recorded.
    ///
    /// Returns the decision when approved. A rejection disables retries for
    /// the attempt and fails it. Run cancellation ends the wait with an error.
    pub async fn wait(&self, ctx: &TaskContext) -> anyhow::Result<ApprovalDecision> {
        let key = (ctx.run_id(), ctx.node().to_string());
        // Declared before `rx` so the receiver is gone when the guard runs,
        // including when the engine drops this future mid-wait.
        let _guard = ChannelGuard {
            channels: &self.channels,
            key: key.clone(),
        };
        let mut rx = self.sender(&key).subscribe();

        let decision = match self.repo.get_approval(&key.0, &key.1).await? {
            Some(decision) => decision,
            None => {
                ctx.log("waiting for approval");
                tokio::select! {
                    _ = ctx.cancelled() => {
                        anyhow::bail!("cancelled while waiting for approval");
                    }
                    changed = rx.wait_for(Option::is_some) => {
                        let decision = changed.ok().and_then(|d| d.clone());
                        decision.ok_or_else(|| anyhow::anyhow!("approval channel closed"))?
                    }
                }
            }
        };

        match decision.outcome {
            ApprovalOutcome::Approved => {
                ctx.log(format!("approved by {}", decision.decided_by));
                Ok(decision)
            }
            ApprovalOutcome::Rejected => {
                ctx.disable_retries();
                let reason = decision.reason.as_deref().unwrap_or("no reason given");
                anyhow::bail!("rejected by {}: {reason}", decision.decided_by)
            }
        }
    }

    /// Record an approval for `node` of `run_id`.
    ///
    /// Approving twice is a no-op returning the original decision.
    pub async fn approve(
        &self,
        run_id: Uuid,
        node: &str,
        decided_by: &str,
    ) -> Result<ApprovalDecision, ApprovalError> {
        self.decide(run_id, node, decided_by, ApprovalOutcome::Approved, None)
            .await
    }

    /// Record a rejection for `node` of `run_id`; the gate fails terminally.
    pub async fn reject(
        &self,
        run_id: Uuid,
        node: &str,
        decided_by: &str,
        reason: &str,
    ) -> Result<ApprovalDecision, ApprovalError> {
        self.decide(
            run_id,
            node,
            decided_by,
            ApprovalOutcome::Rejected,
            Some(reason.to_string()),
        )
        .await
    }

    /// Gates currently parked in this process, as `(run_id, node)`.
    pub fn pending(&self) -> Vec<(Uuid, String)> {
        let mut pending: Vec<(Uuid, String)> = self
            .channels
            .iter()
            .filter(|entry| entry.value().receiver_count() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        pending.sort();
        pending
    }

    /// A node body that waits for approval, for use with `DefinitionBuilder::action`.
    ///
    /// The body ignores its inputs; wire it with `()` inputs and ordering edges.
    pub fn gate<V>(
        self: Arc<Self>,
    ) -> impl Fn(TaskContext, V) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static
    where
        V: Send + 'static,
    {
        move |ctx: TaskContext, _inputs: V| {
            let broker = Arc::clone(&self);
            async move { broker.wait(&ctx).await.map(|_| ()) }.boxed()
        }
    }

    async fn decide(
        &self,
        run_id: Uuid,
        node: &str,
        decided_by: &str,
        outcome: ApprovalOutcome,
        reason: Option<String>,
    ) -> Result<ApprovalDecision, ApprovalError> {
        if self.repo.get_run(&run_id).await?.is_none() {
            return Err(ApprovalError::RunNotFound(run_id));
        }
        if self.repo.get_node_record(&run_id, node).await?.is_none() {
            return Err(ApprovalError::NodeNotFound {
                run_id,
                node: node.to_string(),
            });
        }

        let decision = ApprovalDecision {
            run_id,
            node: node.to_string(),
            outcome,
            decided_by: decided_by.to_string(),
            reason,
            decided_at: Utc::now(),
        };

        let decision = match self.repo.save_approval(&decision).await {
            Ok(()) => decision,
            Err(RepositoryError::Conflict(_)) => {
                let existing = self
                    .repo
                    .get_approval(&run_id, node)
                    .await?
                    .ok_or(RepositoryError::NotFound)?;
                if existing.outcome != outcome {
                    return Err(ApprovalError::AlreadyDecided {
                        node: node.to_string(),
                        outcome: existing.outcome,
                    });
                }
                existing
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            run_id = %run_id,
            node,
            outcome = decision.outcome.as_str(),
            decided_by = %decision.decided_by,
            "approval decision recorded"
        );

        if let Some(sender) = self.channels.get(&(run_id, node.to_string())) {
            sender.send_replace(Some(decision.clone()));
        }
        Ok(decision)
    }

    fn sender(&self, key: &(Uuid, String)) -> DecisionSender {
        self.channels
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

/// Drops the channel of a gate once nobody waits on it.
struct ChannelGuard<'a> {
    channels: &'a DashMap<(Uuid, String), DecisionSender>,
    key: (Uuid, String),
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        self.channels
            .remove_if(&self.key, |_, sender| sender.receiver_count() == 0);
    }
}

impl<R: WorkflowRepository> std::fmt::Debug for ApprovalBroker<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalBroker")
            .field("channels", &self.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
