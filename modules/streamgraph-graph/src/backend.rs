//! The seam between the ingestion pipeline and a graph database.
//!
//! A backend accepts two kinds of write: a one-off schema alteration at startup and a
//! transactional upsert that resolves, creates and links the nodes of one post in a
//! single atomic request. Failures come back already classified so callers can decide
//! on retries without parsing driver errors themselves.

use async_trait::async_trait;
use thiserror::Error;

use crate::plan::{Placeholder, UpsertPlan};

/// Whether the upsert transaction is committed immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Now,
    /// The mutation is applied inside a transaction that is never finalized.
    Deferred,
}

/// What the backend did with an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertResponse {
    /// The post was created; graph ids for the post and every user placeholder.
    Created {
        post_id: String,
        user_ids: Vec<(Placeholder, String)>,
    },
    /// The mutation ran but was not committed (`CommitMode::Deferred`).
    Staged,
    /// A post with the plan's external id already exists. Nothing was written.
    PostExists,
}

/// Classified backend failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The transaction handle was already committed or discarded.
    #[error("transaction already finalized: {0}")]
    TransactionFinalized(String),

    /// Optimistic-concurrency abort; the backend advises resubmitting.
    #[error("conflict, retry advised: {0}")]
    RetryAdvised(String),

    #[error("backend error: {0}")]
    Other(String),
}

const UNAVAILABLE_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "failed to connect",
];

const FINALIZED_MARKERS: &[&str] = &[
    "already been committed or discarded",
    "transactionnotfound",
    "transaction has been terminated",
    "transaction has been closed",
];

const RETRY_MARKERS: &[&str] = &[
    "please retry",
    "can retry",
    "transienterror",
    "deadlockdetected",
    "conflicting transactions",
    "constraintvalidationfailed",
];

impl BackendError {
    /// Classify a raw error message from the driver or server.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            BackendError::Unavailable(message)
        } else if FINALIZED_MARKERS.iter().any(|m| lower.contains(m)) {
            BackendError::TransactionFinalized(message)
        } else if RETRY_MARKERS.iter().any(|m| lower.contains(m)) {
            BackendError::RetryAdvised(message)
        } else {
            BackendError::Other(message)
        }
    }

    pub fn is_retry_advised(&self) -> bool {
        matches!(self, BackendError::RetryAdvised(_))
    }
}

impl From<neo4rs::Error> for BackendError {
    fn from(e: neo4rs::Error) -> Self {
        BackendError::classify(e.to_string())
    }
}

/// A graph database the pipeline can write to.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Declare the fixed Post/User schema. Idempotent.
    async fn alter_schema(&self) -> Result<(), BackendError>;

    /// Run the plan's lookups and mutation as one transaction.
    async fn upsert(
        &self,
        plan: &UpsertPlan,
        mode: CommitMode,
    ) -> Result<UpsertResponse, BackendError>;
}
