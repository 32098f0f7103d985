//! In-memory graph backend.
//!
//! Behaves like an optimistic-concurrency database: an upsert reads which keys
//! exist, yields to the scheduler, then validates before applying. If another
//! transaction created one of the keys in between, the later one aborts with
//! `RetryAdvised` and the earlier commit wins. Used by tests and `--dry-run`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use streamgraph_common::{PostRecord, UserRecord};

use crate::backend::{BackendError, CommitMode, GraphBackend, UpsertResponse};
use crate::plan::{Placeholder, UpsertPlan};

/// A committed post and the graph ids of the users it links to.
#[derive(Debug, Clone)]
pub struct StoredPost {
    pub graph_id: String,
    pub record: PostRecord,
    pub author: String,
    /// One entry per mention edge, in position order.
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub graph_id: String,
    pub record: UserRecord,
}

#[derive(Default)]
struct State {
    next_id: u64,
    posts: HashMap<String, StoredPost>,
    users: HashMap<String, StoredUser>,
    staged: Vec<UpsertPlan>,
    injected: VecDeque<BackendError>,
    upserts: u64,
}

impl State {
    fn allocate(&mut self) -> String {
        self.next_id += 1;
        format!("0x{:x}", self.next_id)
    }
}

#[derive(Default)]
pub struct MemoryGraph {
    state: Mutex<State>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next upsert attempt fail with `error`. Calls queue up in order.
    pub fn fail_next(&self, error: BackendError) {
        self.lock().injected.push_back(error);
    }

    /// Number of upsert attempts received, failed ones included.
    pub fn upsert_attempts(&self) -> u64 {
        self.lock().upserts
    }

    /// Copy of the committed graph for assertions.
    pub fn snapshot(&self) -> GraphSnapshot {
        let state = self.lock();
        GraphSnapshot {
            posts: state.posts.values().cloned().collect(),
            users: state.users.values().cloned().collect(),
            staged: state.staged.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GraphBackend for MemoryGraph {
    async fn alter_schema(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn upsert(
        &self,
        plan: &UpsertPlan,
        mode: CommitMode,
    ) -> Result<UpsertResponse, BackendError> {
        // Read phase: which nodes does this transaction expect to create?
        let absent_users: Vec<String> = {
            let mut state = self.lock();
            state.upserts += 1;
            if let Some(error) = state.injected.pop_front() {
                return Err(error);
            }
            if state.posts.contains_key(&plan.post.external_id) {
                return Ok(UpsertResponse::PostExists);
            }
            plan.user_keys()
                .filter(|key| !state.users.contains_key(*key))
                .map(str::to_string)
                .collect()
        };

        // Other transactions may commit here.
        tokio::task::yield_now().await;

        // Validate and apply phase.
        let mut guard = self.lock();
        let state = &mut *guard;
        let lost_race = state.posts.contains_key(&plan.post.external_id)
            || absent_users.iter().any(|key| state.users.contains_key(key));
        if lost_race {
            return Err(BackendError::RetryAdvised(
                "conflicting transactions, please retry".into(),
            ));
        }

        if mode == CommitMode::Deferred {
            state.staged.push(plan.clone());
            return Ok(UpsertResponse::Staged);
        }

        let mut user_ids = Vec::with_capacity(plan.users.len());
        for slot in &plan.users {
            let graph_id = match state.users.get_mut(&slot.user.external_id) {
                Some(existing) => {
                    existing.record.fill_missing(&slot.user);
                    existing.graph_id.clone()
                }
                None => {
                    let graph_id = state.allocate();
                    state.users.insert(
                        slot.user.external_id.clone(),
                        StoredUser {
                            graph_id: graph_id.clone(),
                            record: slot.user.clone(),
                        },
                    );
                    graph_id
                }
            };
            user_ids.push((slot.placeholder.clone(), graph_id));
        }

        let id_of = |placeholder: &Placeholder| {
            user_ids
                .iter()
                .find(|(p, _)| p == placeholder)
                .map(|(_, id)| id.clone())
                .unwrap_or_default()
        };
        let author = id_of(&plan.author);
        let mentions = plan.mentions.iter().map(id_of).collect();

        let post_id = state.allocate();
        state.posts.insert(
            plan.post.external_id.clone(),
            StoredPost {
                graph_id: post_id.clone(),
                record: plan.post.clone(),
                author,
                mentions,
            },
        );

        Ok(UpsertResponse::Created { post_id, user_ids })
    }
}

/// Point-in-time copy of a `MemoryGraph`.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub posts: Vec<StoredPost>,
    pub users: Vec<StoredUser>,
    /// Deferred mutations that were never finalized.
    pub staged: usize,
}

impl GraphSnapshot {
    pub fn post(&self, external_id: &str) -> Option<&StoredPost> {
        self.posts.iter().find(|p| p.record.external_id == external_id)
    }

    pub fn user(&self, external_id: &str) -> Option<&StoredUser> {
        self.users.iter().find(|u| u.record.external_id == external_id)
    }

    /// Number of user nodes carrying `external_id`.
    pub fn users_with_id(&self, external_id: &str) -> usize {
        self.users
            .iter()
            .filter(|u| u.record.external_id == external_id)
            .count()
    }

    /// External id of the user behind a graph id.
    pub fn user_key(&self, graph_id: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|u| u.graph_id == graph_id)
            .map(|u| u.record.external_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use streamgraph_common::CanonicalRecord;

    use super::*;
    use crate::plan::build_upsert_plan;

    fn plan(post: &str, author: &str, mentions: &[&str]) -> UpsertPlan {
        build_upsert_plan(&CanonicalRecord {
            post: PostRecord {
                external_id: post.into(),
                created_at: DateTime::parse_from_rfc3339("2018-10-10T20:19:24+00:00").unwrap(),
                message: String::new(),
                urls: vec![],
                hashtags: vec![],
                is_retweet: false,
            },
            author: UserRecord::with_id(author),
            mentions: mentions.iter().map(|m| UserRecord::with_id(*m)).collect(),
        })
    }

    #[tokio::test]
    async fn creates_post_and_links_users() {
        let graph = MemoryGraph::new();
        let resp = graph.upsert(&plan("p1", "u1", &["u2"]), CommitMode::Now).await.unwrap();
        assert!(matches!(resp, UpsertResponse::Created { .. }));

        let snap = graph.snapshot();
        let post = snap.post("p1").unwrap();
        assert_eq!(snap.user_key(&post.author), Some("u1"));
        assert_eq!(snap.user_key(&post.mentions[0]), Some("u2"));
    }

    #[tokio::test]
    async fn second_write_of_same_post_reports_existing() {
        let graph = MemoryGraph::new();
        graph.upsert(&plan("p1", "u1", &[]), CommitMode::Now).await.unwrap();
        let resp = graph.upsert(&plan("p1", "u1", &[]), CommitMode::Now).await.unwrap();
        assert_eq!(resp, UpsertResponse::PostExists);
        assert_eq!(graph.snapshot().posts.len(), 1);
    }

    #[tokio::test]
    async fn existing_user_is_reused_not_duplicated() {
        let graph = MemoryGraph::new();
        graph.upsert(&plan("p1", "u1", &[]), CommitMode::Now).await.unwrap();
        graph.upsert(&plan("p2", "u2", &["u1"]), CommitMode::Now).await.unwrap();
        let snap = graph.snapshot();
        assert_eq!(snap.users_with_id("u1"), 1);
        assert_eq!(snap.post("p1").unwrap().author, snap.post("p2").unwrap().mentions[0]);
    }

    #[tokio::test]
    async fn deferred_mutation_is_staged_not_applied() {
        let graph = MemoryGraph::new();
        let resp = graph.upsert(&plan("p1", "u1", &[]), CommitMode::Deferred).await.unwrap();
        assert_eq!(resp, UpsertResponse::Staged);
        let snap = graph.snapshot();
        assert!(snap.posts.is_empty());
        assert_eq!(snap.staged, 1);
    }

    #[tokio::test]
    async fn injected_failures_are_returned_in_order() {
        let graph = MemoryGraph::new();
        graph.fail_next(BackendError::Unavailable("connection refused".into()));
        graph.fail_next(BackendError::Other("boom".into()));
        let p = plan("p1", "u1", &[]);
        assert!(matches!(graph.upsert(&p, CommitMode::Now).await, Err(BackendError::Unavailable(_))));
        assert!(matches!(graph.upsert(&p, CommitMode::Now).await, Err(BackendError::Other(_))));
        assert!(graph.upsert(&p, CommitMode::Now).await.is_ok());
        assert_eq!(graph.upsert_attempts(), 3);
    }

    #[tokio::test]
    async fn concurrent_creators_of_same_user_conflict_then_converge() {
        let graph = MemoryGraph::new();
        let a = plan("pa", "shared", &[]);
        let b = plan("pb", "shared", &[]);

        let (ra, rb) = tokio::join!(
            graph.upsert(&a, CommitMode::Now),
            graph.upsert(&b, CommitMode::Now)
        );
        // Interleaved on one task: both read "shared" as absent, the second validator loses.
        let results = [ra, rb];
        let conflicts = results.iter().filter(|r| matches!(r, Err(e) if e.is_retry_advised())).count();
        assert_eq!(conflicts, 1);

        for (p, r) in [(&a, &results[0]), (&b, &results[1])] {
            if r.is_err() {
                graph.upsert(p, CommitMode::Now).await.unwrap();
            }
        }
        let snap = graph.snapshot();
        assert_eq!(snap.users_with_id("shared"), 1);
        assert_eq!(snap.post("pa").unwrap().author, snap.post("pb").unwrap().author);
    }
}
