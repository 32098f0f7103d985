//! The nine read queries: how each samples its parameters and what it checks.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use rand::seq::IndexedRandom;
use thiserror::Error;

use streamgraph_graph::GraphReader;

use crate::checks::{self, CheckError};

/// Parameter samples are drawn from a random page of at most this many values.
const SAMPLE_PAGE: i64 = 100;
/// Upper bound (exclusive) of the random sampling offset.
const SAMPLE_SPREAD: i64 = 1000;
/// Rows requested by lookup and ranking queries.
const RESULT_LIMIT: i64 = 100;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("graph query failed")]
    Graph(#[from] neo4rs::Error),

    #[error("no {0} in the graph to sample from")]
    NoData(&'static str),

    #[error("{query}: {source}")]
    Check {
        query: &'static str,
        #[source]
        source: CheckError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    PostsByHashtag,
    UsersByHandle,
    MostMentioned,
    MostProlific,
    UserById,
    RecentPostsByHashtag,
    RecentUsersByHandle,
    RecentMostProlific,
    RecentUserById,
}

impl QueryKind {
    pub const ALL: [QueryKind; 9] = [
        QueryKind::PostsByHashtag,
        QueryKind::UsersByHandle,
        QueryKind::MostMentioned,
        QueryKind::MostProlific,
        QueryKind::UserById,
        QueryKind::RecentPostsByHashtag,
        QueryKind::RecentUsersByHandle,
        QueryKind::RecentMostProlific,
        QueryKind::RecentUserById,
    ];

    pub fn name(self) -> &'static str {
        match self {
            QueryKind::PostsByHashtag => "posts_by_hashtag",
            QueryKind::UsersByHandle => "users_by_handle",
            QueryKind::MostMentioned => "most_mentioned",
            QueryKind::MostProlific => "most_prolific",
            QueryKind::UserById => "user_by_id",
            QueryKind::RecentPostsByHashtag => "recent_posts_by_hashtag",
            QueryKind::RecentUsersByHandle => "recent_users_by_handle",
            QueryKind::RecentMostProlific => "recent_most_prolific",
            QueryKind::RecentUserById => "recent_user_by_id",
        }
    }

    /// Share of the mix: how many concurrent loops run this kind.
    pub fn weight(self) -> usize {
        match self {
            QueryKind::PostsByHashtag => 6,
            QueryKind::UsersByHandle => 7,
            QueryKind::MostMentioned => 5,
            QueryKind::MostProlific => 5,
            QueryKind::UserById => 3,
            QueryKind::RecentPostsByHashtag => 3,
            QueryKind::RecentUsersByHandle => 2,
            QueryKind::RecentMostProlific => 4,
            QueryKind::RecentUserById => 2,
        }
    }

    /// Whether the kind only considers posts newer than the recency cutoff.
    pub fn is_recent(self) -> bool {
        matches!(
            self,
            QueryKind::RecentPostsByHashtag
                | QueryKind::RecentUsersByHandle
                | QueryKind::RecentMostProlific
                | QueryKind::RecentUserById
        )
    }
}

/// Parameters sampled by a prepare step, reused for many runs.
#[derive(Debug, Clone)]
pub enum Prepared {
    PostsByHashtag { kind: QueryKind, tags: Vec<String> },
    UsersByHandle { kind: QueryKind, handles: Vec<String> },
    MostMentioned,
    MostProlific { kind: QueryKind, since: Option<DateTime<FixedOffset>> },
    UserById { kind: QueryKind, ids: Vec<String> },
}

impl Prepared {
    pub fn kind(&self) -> QueryKind {
        match self {
            Prepared::PostsByHashtag { kind, .. }
            | Prepared::UsersByHandle { kind, .. }
            | Prepared::MostProlific { kind, .. }
            | Prepared::UserById { kind, .. } => *kind,
            Prepared::MostMentioned => QueryKind::MostMentioned,
        }
    }
}

/// A read workload the runner can drive.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    type Prepared: Send + Sync + 'static;

    /// Sample parameters for `kind` from the graph.
    async fn prepare(&self, kind: QueryKind) -> Result<Self::Prepared, QueryError>;

    /// Run one query with the sampled parameters and check its shape.
    /// Returns the number of rows checked.
    async fn run(&self, prepared: &Self::Prepared) -> Result<usize, QueryError>;
}

/// The nine queries against a live graph. Calls rotate over the readers.
pub struct GraphWorkload {
    readers: Vec<GraphReader>,
    next: AtomicUsize,
    recent: Duration,
}

impl GraphWorkload {
    pub fn new(readers: Vec<GraphReader>, recent_hours: i64) -> Result<Self, QueryError> {
        if readers.is_empty() {
            return Err(QueryError::NoData("backends"));
        }
        Ok(Self {
            readers,
            next: AtomicUsize::new(0),
            recent: Duration::hours(recent_hours),
        })
    }

    fn reader(&self) -> &GraphReader {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.readers[n % self.readers.len()]
    }

    fn cutoff(&self, kind: QueryKind) -> Option<DateTime<FixedOffset>> {
        kind.is_recent()
            .then(|| (Utc::now() - self.recent).fixed_offset())
    }
}

#[async_trait]
impl Workload for GraphWorkload {
    type Prepared = Prepared;

    async fn prepare(&self, kind: QueryKind) -> Result<Prepared, QueryError> {
        let since = self.cutoff(kind);
        let prepared = match kind {
            QueryKind::PostsByHashtag | QueryKind::RecentPostsByHashtag => {
                let reader = self.reader();
                let tags = sample(|offset| reader.sample_hashtags(offset, SAMPLE_PAGE, since)).await?;
                Prepared::PostsByHashtag {
                    kind,
                    tags: non_empty(tags, "hashtags")?,
                }
            }
            QueryKind::UsersByHandle | QueryKind::RecentUsersByHandle => {
                let reader = self.reader();
                let handles = sample(|offset| reader.sample_handles(offset, SAMPLE_PAGE, since)).await?;
                Prepared::UsersByHandle {
                    kind,
                    handles: non_empty(handles, "handles")?,
                }
            }
            QueryKind::UserById | QueryKind::RecentUserById => {
                let reader = self.reader();
                let ids = sample(|offset| reader.sample_user_ids(offset, SAMPLE_PAGE, since)).await?;
                Prepared::UserById {
                    kind,
                    ids: non_empty(ids, "users")?,
                }
            }
            QueryKind::MostMentioned => Prepared::MostMentioned,
            QueryKind::MostProlific | QueryKind::RecentMostProlific => {
                Prepared::MostProlific { kind, since }
            }
        };
        Ok(prepared)
    }

    async fn run(&self, prepared: &Prepared) -> Result<usize, QueryError> {
        let query = prepared.kind().name();
        let check = |result: Result<(), CheckError>| {
            result.map_err(|source| QueryError::Check { query, source })
        };

        match prepared {
            Prepared::PostsByHashtag { tags, .. } => {
                let tag = pick(tags, "hashtags")?;
                let posts = self.reader().posts_with_hashtag(tag, RESULT_LIMIT).await?;
                check(checks::posts_with_hashtag(tag, &posts))?;
                Ok(posts.len())
            }
            Prepared::UsersByHandle { handles, .. } => {
                let handle = pick(handles, "handles")?;
                let users = self.reader().users_by_handle(handle).await?;
                check(checks::users_with_handle(handle, &users))?;
                Ok(users.len())
            }
            Prepared::MostMentioned => {
                let ranked = self.reader().most_mentioned(RESULT_LIMIT).await?;
                check(checks::ranking(&ranked))?;
                Ok(ranked.len())
            }
            Prepared::MostProlific { since, .. } => {
                let ranked = self.reader().most_prolific(RESULT_LIMIT, *since).await?;
                check(checks::ranking(&ranked))?;
                Ok(ranked.len())
            }
            Prepared::UserById { ids, .. } => {
                let id = pick(ids, "users")?;
                let user = self.reader().user(id).await?;
                check(checks::user_by_id(id, user.as_ref()))?;
                Ok(1)
            }
        }
    }
}

/// Sample a random page; fall back to the first page when the graph is smaller
/// than the offset.
async fn sample<F, Fut>(mut page: F) -> Result<Vec<String>, QueryError>
where
    F: FnMut(i64) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<String>, neo4rs::Error>>,
{
    let offset = rand::random_range(0..SAMPLE_SPREAD);
    let values = page(offset).await?;
    if !values.is_empty() || offset == 0 {
        return Ok(values);
    }
    Ok(page(0).await?)
}

fn non_empty(values: Vec<String>, what: &'static str) -> Result<Vec<String>, QueryError> {
    if values.is_empty() {
        Err(QueryError::NoData(what))
    } else {
        Ok(values)
    }
}

fn pick<'a>(values: &'a [String], what: &'static str) -> Result<&'a str, QueryError> {
    values
        .choose(&mut rand::rng())
        .map(String::as_str)
        .ok_or(QueryError::NoData(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nine_kinds_four_of_them_recent() {
        assert_eq!(QueryKind::ALL.len(), 9);
        assert_eq!(QueryKind::ALL.iter().filter(|k| k.is_recent()).count(), 4);
    }

    #[test]
    fn every_kind_has_a_distinct_name_and_positive_weight() {
        let mut names: Vec<&str> = QueryKind::ALL.iter().map(|k| k.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 9);
        assert!(QueryKind::ALL.iter().all(|k| k.weight() > 0));
    }

    #[tokio::test]
    async fn sample_falls_back_to_first_page() {
        let values = sample(|offset| async move {
            Ok::<_, neo4rs::Error>(if offset == 0 { vec!["a".to_string()] } else { vec![] })
        })
        .await
        .unwrap();
        assert_eq!(values, vec!["a"]);
    }

    #[test]
    fn pick_from_nothing_is_no_data() {
        assert!(matches!(pick(&[], "hashtags"), Err(QueryError::NoData("hashtags"))));
    }
}
