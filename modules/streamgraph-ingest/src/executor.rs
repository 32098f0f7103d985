//! Upsert Executor: submits one plan to a backend and turns the heterogeneous
//! failure modes into a bounded retry policy.
//!
//! | backend result        | action                                   | outcome                      |
//! |-----------------------|------------------------------------------|------------------------------|
//! | created / staged      |                                          | `Committed` / `CommittedDeferred` |
//! | post exists           | log                                      | `SkippedDuplicate`           |
//! | unavailable           | wait `unavailable_cooldown`              | `Failed(Transient)`          |
//! | transaction finalized | log error                                | `Failed(TransactionReuse)`   |
//! | retry advised         | wait `conflict_delay`, resubmit once     | `Failed(Conflict)` if again  |
//! | anything else         | log raw error                            | `Failed(Other)`              |
//!
//! Records are never requeued here. Every outcome is counted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use streamgraph_graph::{BackendError, CommitMode, GraphBackend, UpsertPlan, UpsertResponse};

use crate::stats::IngestStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Backend unreachable.
    Transient,
    /// The transaction handle was already finalized. A sequencing bug if ever seen.
    TransactionReuse,
    /// Optimistic-concurrency conflict on every allowed attempt.
    Conflict,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Staged without commit-now. Not durable.
    CommittedDeferred,
    SkippedDuplicate,
    Failed(FailureKind),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause after a connection-level failure before reporting it.
    pub unavailable_cooldown: Duration,
    /// Pause before resubmitting a conflicted transaction.
    pub conflict_delay: Duration,
    /// Total submissions allowed when the backend keeps advising a retry.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unavailable_cooldown: Duration::from_secs(5),
            conflict_delay: Duration::from_millis(100),
            max_attempts: 2,
        }
    }
}

/// Result of one submission.
#[derive(Debug, PartialEq)]
enum Attempt {
    Done(CommitOutcome),
    Conflict(String),
}

pub struct Executor {
    backend: Arc<dyn GraphBackend>,
    policy: RetryPolicy,
    stats: Arc<IngestStats>,
}

impl Executor {
    pub fn new(backend: Arc<dyn GraphBackend>, policy: RetryPolicy, stats: Arc<IngestStats>) -> Self {
        Self {
            backend,
            policy,
            stats,
        }
    }

    pub async fn commit(&self, plan: &UpsertPlan, mode: CommitMode) -> CommitOutcome {
        let external_id = plan.post.external_id.as_str();
        let mut attempt = 1;
        let outcome = loop {
            match self.submit(plan, mode).await {
                Attempt::Done(outcome) => break outcome,
                Attempt::Conflict(reason) if attempt < self.policy.max_attempts => {
                    self.stats.record_conflict_retry();
                    info!(external_id, attempt, reason = reason.as_str(), "Conflict, resubmitting");
                    tokio::time::sleep(self.policy.conflict_delay).await;
                    attempt += 1;
                }
                Attempt::Conflict(reason) => {
                    warn!(external_id, attempt, reason = reason.as_str(), "Conflict persisted, giving up");
                    break CommitOutcome::Failed(FailureKind::Conflict);
                }
            }
        };
        self.stats.record_outcome(&outcome);
        outcome
    }

    async fn submit(&self, plan: &UpsertPlan, mode: CommitMode) -> Attempt {
        let external_id = plan.post.external_id.as_str();
        let attempt = classify(self.backend.upsert(plan, mode).await);
        match &attempt {
            Attempt::Done(CommitOutcome::SkippedDuplicate) => {
                info!(external_id, "Duplicate post, skipped");
            }
            Attempt::Done(CommitOutcome::Failed(FailureKind::Transient)) => {
                warn!(
                    external_id,
                    cooldown_ms = self.policy.unavailable_cooldown.as_millis() as u64,
                    "Backend unavailable, dropping record after cooldown"
                );
                tokio::time::sleep(self.policy.unavailable_cooldown).await;
            }
            Attempt::Done(CommitOutcome::Failed(FailureKind::TransactionReuse)) => {
                error!(external_id, "Transaction reused after being finalized");
            }
            Attempt::Done(CommitOutcome::Committed | CommitOutcome::CommittedDeferred) => {
                debug!(external_id, "Upsert done");
            }
            Attempt::Done(_) | Attempt::Conflict(_) => {}
        }
        attempt
    }
}

fn classify(result: Result<UpsertResponse, BackendError>) -> Attempt {
    match result {
        Ok(UpsertResponse::Created { .. }) => Attempt::Done(CommitOutcome::Committed),
        Ok(UpsertResponse::Staged) => Attempt::Done(CommitOutcome::CommittedDeferred),
        Ok(UpsertResponse::PostExists) => Attempt::Done(CommitOutcome::SkippedDuplicate),
        Err(BackendError::Unavailable(_)) => Attempt::Done(CommitOutcome::Failed(FailureKind::Transient)),
        Err(BackendError::TransactionFinalized(_)) => {
            Attempt::Done(CommitOutcome::Failed(FailureKind::TransactionReuse))
        }
        Err(BackendError::RetryAdvised(reason)) => Attempt::Conflict(reason),
        Err(BackendError::Other(reason)) => {
            warn!(error = reason.as_str(), "Unclassified backend error");
            Attempt::Done(CommitOutcome::Failed(FailureKind::Other))
        }
    }
}
