use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use streamgraph_common::StreamMessage;
use streamgraph_graph::{build_upsert_plan, CommitMode, GraphBackend};

use crate::executor::{CommitOutcome, Executor, RetryPolicy};
use crate::normalize::{normalize, NormalizeError};
use crate::stats::IngestStats;

/// What a dispatcher worker does with each dequeued message.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, message: StreamMessage);
}

/// Normalize → resolve → commit, strictly in sequence for one record.
pub struct RecordPipeline {
    executor: Executor,
    defer_ratio: f64,
    stats: Arc<IngestStats>,
}

impl RecordPipeline {
    pub fn new(
        backend: Arc<dyn GraphBackend>,
        policy: RetryPolicy,
        defer_ratio: f64,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            executor: Executor::new(backend, policy, stats.clone()),
            defer_ratio,
            stats,
        }
    }

    /// Run one message through the pipeline. `None` when the Normalizer dropped it.
    pub async fn process(&self, message: &StreamMessage) -> Option<CommitOutcome> {
        let record = match normalize(message) {
            Ok(record) => record,
            Err(NormalizeError::NotAPost) => {
                self.stats.record_skipped();
                return None;
            }
            Err(e) => {
                debug!(error = %e, "Rejected post");
                self.stats.record_rejected();
                return None;
            }
        };

        let plan = build_upsert_plan(&record);
        Some(self.executor.commit(&plan, self.commit_mode()).await)
    }

    fn commit_mode(&self) -> CommitMode {
        if self.defer_ratio > 0.0 && rand::random::<f64>() < self.defer_ratio {
            CommitMode::Deferred
        } else {
            CommitMode::Now
        }
    }
}

#[async_trait]
impl RecordHandler for RecordPipeline {
    async fn handle(&self, message: StreamMessage) {
        self.stats.record_received();
        self.process(&message).await;
    }
}

#[cfg(test)]
mod tests {
    use streamgraph_graph::MemoryGraph;

    use super::*;

    fn pipeline(graph: Arc<MemoryGraph>, defer_ratio: f64) -> (RecordPipeline, Arc<IngestStats>) {
        let stats = IngestStats::new();
        (
            RecordPipeline::new(graph, RetryPolicy::default(), defer_ratio, stats.clone()),
            stats,
        )
    }

    fn post(id: &str, created_at: &str) -> StreamMessage {
        StreamMessage::from_json(&format!(
            r#"{{"id_str":"{id}","created_at":"{created_at}","text":"hi","user":{{"id_str":"u1"}}}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_timestamp_never_reaches_the_backend() {
        let graph = Arc::new(MemoryGraph::new());
        let (pipeline, stats) = pipeline(graph.clone(), 0.0);

        assert_eq!(pipeline.process(&post("1", "yesterday")).await, None);

        let snap = stats.snapshot();
        assert_eq!(snap.failed(), 1);
        assert_eq!(snap.committed, 0);
        assert_eq!(graph.upsert_attempts(), 0);
    }

    #[tokio::test]
    async fn non_post_is_skipped_not_failed() {
        let graph = Arc::new(MemoryGraph::new());
        let (pipeline, stats) = pipeline(graph.clone(), 0.0);

        let keep_alive = StreamMessage::from_json(r#"{"delete":{}}"#).unwrap();
        assert_eq!(pipeline.process(&keep_alive).await, None);
        assert_eq!(stats.snapshot().skipped, 1);
        assert_eq!(stats.snapshot().failed(), 0);
    }

    #[tokio::test]
    async fn valid_post_is_committed() {
        let graph = Arc::new(MemoryGraph::new());
        let (pipeline, stats) = pipeline(graph.clone(), 0.0);

        let outcome = pipeline.process(&post("1", "Wed Oct 10 20:19:24 +0000 2018")).await;
        assert_eq!(outcome, Some(CommitOutcome::Committed));
        assert_eq!(stats.snapshot().committed, 1);
        assert!(graph.snapshot().post("1").is_some());
    }

    #[tokio::test]
    async fn mistyped_post_counts_as_failure() {
        let graph = Arc::new(MemoryGraph::new());
        let (pipeline, stats) = pipeline(graph.clone(), 0.0);

        let numeric_time = StreamMessage::from_json(
            r#"{"id_str":"1","created_at":12345,"user":{"id_str":"u1"}}"#,
        )
        .unwrap();
        let numeric_id =
            StreamMessage::from_json(r#"{"id_str":2,"created_at":"x","user":{"id_str":"u1"}}"#)
                .unwrap();
        assert_eq!(pipeline.process(&numeric_time).await, None);
        assert_eq!(pipeline.process(&numeric_id).await, None);

        let snap = stats.snapshot();
        assert_eq!(snap.rejected, 2);
        assert_eq!(snap.skipped, 0);
        assert_eq!(graph.upsert_attempts(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_delivery_of_one_post_commits_it_once() {
        let graph = Arc::new(MemoryGraph::new());
        let stats = IngestStats::new();
        let policy = RetryPolicy {
            conflict_delay: std::time::Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let pipeline = RecordPipeline::new(graph.clone(), policy, 0.0, stats.clone());
        let first = post("1", "Wed Oct 10 20:19:24 +0000 2018");
        let second = first.clone();

        let (a, b) = tokio::join!(pipeline.process(&first), pipeline.process(&second));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, CommitOutcome::SkippedDuplicate));
        assert_eq!(
            outcomes,
            vec![CommitOutcome::Committed, CommitOutcome::SkippedDuplicate]
        );

        let snap = graph.snapshot();
        assert_eq!(snap.posts.len(), 1);
        assert_eq!(snap.users_with_id("u1"), 1);
        assert_eq!(stats.snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn full_defer_ratio_stages_every_record() {
        let graph = Arc::new(MemoryGraph::new());
        let (pipeline, stats) = pipeline(graph.clone(), 1.0);

        for i in 0..5 {
            let outcome = pipeline.process(&post(&i.to_string(), "Wed Oct 10 20:19:24 +0000 2018")).await;
            assert_eq!(outcome, Some(CommitOutcome::CommittedDeferred));
        }
        assert_eq!(stats.snapshot().deferred, 5);
        assert!(graph.snapshot().posts.is_empty());
    }
}
