use async_trait::async_trait;
use neo4rs::{query, BoltNull, BoltType, Query};
use tracing::debug;

use crate::backend::{BackendError, CommitMode, GraphBackend, UpsertResponse};
use crate::migrate::migrate;
use crate::plan::{UpsertPlan, UserSlot};
use crate::GraphClient;

/// User properties written alongside `external_id`.
const USER_ATTRS: &[&str] = &[
    "display_name",
    "handle",
    "bio",
    "profile_image_url",
    "profile_banner_url",
    "follower_count",
    "following_count",
    "verified",
];

/// Write-side wrapper for the graph. Used by the ingestion pipeline.
#[derive(Clone)]
pub struct GraphWriter {
    client: GraphClient,
}

impl GraphWriter {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GraphBackend for GraphWriter {
    async fn alter_schema(&self) -> Result<(), BackendError> {
        migrate(&self.client).await.map_err(BackendError::from)
    }

    async fn upsert(
        &self,
        plan: &UpsertPlan,
        mode: CommitMode,
    ) -> Result<UpsertResponse, BackendError> {
        let q = upsert_query(plan);

        let mut txn = self.client.graph.start_txn().await?;
        let mut rows = txn.execute(q).await?;

        let mut created: Option<(i64, Vec<i64>)> = None;
        while let Some(row) = rows.next(txn.handle()).await? {
            if created.is_none() {
                let post_id: i64 = row
                    .get("post_id")
                    .map_err(|e| BackendError::Other(format!("decoding post_id: {e}")))?;
                let user_ids: Vec<i64> = row
                    .get("user_ids")
                    .map_err(|e| BackendError::Other(format!("decoding user_ids: {e}")))?;
                created = Some((post_id, user_ids));
            }
        }

        let Some((post_id, user_ids)) = created else {
            // The guard on the post key filtered every row: nothing was written.
            txn.rollback().await?;
            debug!(external_id = plan.post.external_id.as_str(), "Post already in graph");
            return Ok(UpsertResponse::PostExists);
        };

        match mode {
            CommitMode::Now => txn.commit().await?,
            CommitMode::Deferred => {
                txn.rollback().await?;
                return Ok(UpsertResponse::Staged);
            }
        }

        Ok(UpsertResponse::Created {
            post_id: post_id.to_string(),
            user_ids: plan
                .users
                .iter()
                .zip(user_ids)
                .map(|(slot, id)| (slot.placeholder.clone(), id.to_string()))
                .collect(),
        })
    }
}

/// Render a plan as one parametrized Cypher statement.
pub(crate) fn upsert_query(plan: &UpsertPlan) -> Query {
    let mut q = query(&upsert_cypher(plan))
        .param("post_external_id", plan.post.external_id.as_str())
        .param("post_created_at", plan.post.created_at.to_rfc3339())
        .param("post_message", plan.post.message.as_str())
        .param("post_urls", plan.post.urls.clone())
        .param("post_hashtags", plan.post.hashtags.clone())
        .param("post_is_retweet", plan.post.is_retweet);

    for slot in &plan.users {
        q = bind_user(q, slot);
    }
    q
}

/// Statement shape:
/// 1. `OPTIONAL MATCH` the post by external id and stop (zero rows) if it exists.
/// 2. `MERGE` every distinct user; new users get all attributes, existing users only
///    have absent attributes filled.
/// 3. `CREATE` the post and its AUTHOR / MENTION edges.
fn upsert_cypher(plan: &UpsertPlan) -> String {
    let post = plan.post_ref.as_str();
    let mut cypher = String::from(
        "OPTIONAL MATCH (existing:Post {external_id: $post_external_id})\n\
         WITH existing WHERE existing IS NULL\n",
    );

    // Consistent lock order across concurrent writers.
    let mut slots: Vec<&UserSlot> = plan.users.iter().collect();
    slots.sort_by(|a, b| a.user.external_id.cmp(&b.user.external_id));
    for slot in &slots {
        cypher.push_str(&merge_user_clause(slot.placeholder.as_str()));
    }

    cypher.push_str(&format!(
        "CREATE ({post}:Post {{external_id: $post_external_id, created_at: datetime($post_created_at), \
         message: $post_message, urls: $post_urls, hashtags: $post_hashtags, is_retweet: $post_is_retweet}})\n"
    ));
    cypher.push_str(&format!(
        "CREATE ({post})-[:AUTHOR]->({})\n",
        plan.author.as_str()
    ));
    for (position, mention) in plan.mentions.iter().enumerate() {
        cypher.push_str(&format!(
            "CREATE ({post})-[:MENTION {{position: {position}}}]->({})\n",
            mention.as_str()
        ));
    }

    let user_ids: Vec<String> = plan
        .users
        .iter()
        .map(|slot| format!("id({})", slot.placeholder.as_str()))
        .collect();
    cypher.push_str(&format!(
        "RETURN id({post}) AS post_id, [{}] AS user_ids",
        user_ids.join(", ")
    ));
    cypher
}

fn merge_user_clause(var: &str) -> String {
    let on_create: Vec<String> = USER_ATTRS
        .iter()
        .map(|attr| format!("{var}.{attr} = ${var}_{attr}"))
        .collect();
    let on_match: Vec<String> = USER_ATTRS
        .iter()
        .map(|attr| format!("{var}.{attr} = coalesce({var}.{attr}, ${var}_{attr})"))
        .collect();
    format!(
        "MERGE ({var}:User {{external_id: ${var}_external_id}})\n\
         ON CREATE SET {}\n\
         ON MATCH SET {}\n",
        on_create.join(", "),
        on_match.join(", ")
    )
}

fn bind_user(q: Query, slot: &UserSlot) -> Query {
    let var = slot.placeholder.as_str();
    let u = &slot.user;
    q.param(&format!("{var}_external_id"), u.external_id.as_str())
        .param(&format!("{var}_display_name"), opt(u.display_name.clone()))
        .param(&format!("{var}_handle"), opt(u.handle.clone()))
        .param(&format!("{var}_bio"), opt(u.bio.clone()))
        .param(&format!("{var}_profile_image_url"), opt(u.profile_image_url.clone()))
        .param(&format!("{var}_profile_banner_url"), opt(u.profile_banner_url.clone()))
        .param(&format!("{var}_follower_count"), opt(u.follower_count))
        .param(&format!("{var}_following_count"), opt(u.following_count))
        .param(&format!("{var}_verified"), opt(u.verified))
}

/// Absent values become Cypher `null`, which `SET` and `coalesce` treat as "no value".
fn opt<T: Into<BoltType>>(value: Option<T>) -> BoltType {
    value.map(Into::into).unwrap_or(BoltType::Null(BoltNull))
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use streamgraph_common::{CanonicalRecord, PostRecord, UserRecord};

    use super::*;
    use crate::plan::build_upsert_plan;

    fn plan() -> UpsertPlan {
        build_upsert_plan(&CanonicalRecord {
            post: PostRecord {
                external_id: "p1".into(),
                created_at: DateTime::parse_from_rfc3339("2018-10-10T20:19:24+00:00").unwrap(),
                message: "hi".into(),
                urls: vec![],
                hashtags: vec!["rust".into()],
                is_retweet: false,
            },
            author: UserRecord::with_id("zed"),
            mentions: vec![
                UserRecord::with_id("amy"),
                UserRecord::with_id("amy"),
            ],
        })
    }

    #[test]
    fn guard_precedes_every_write() {
        let cypher = upsert_cypher(&plan());
        let guard = cypher.find("WHERE existing IS NULL").unwrap();
        let first_write = cypher.find("MERGE").unwrap();
        assert!(guard < first_write);
    }

    #[test]
    fn one_merge_per_distinct_user_in_key_order() {
        let cypher = upsert_cypher(&plan());
        assert_eq!(cypher.matches("MERGE (").count(), 2);
        // amy (user_2) sorts before zed (user_1).
        let amy = cypher.find("MERGE (user_2:User").unwrap();
        let zed = cypher.find("MERGE (user_1:User").unwrap();
        assert!(amy < zed);
    }

    #[test]
    fn repeated_mentions_create_one_edge_each_to_the_same_node() {
        let cypher = upsert_cypher(&plan());
        assert!(cypher.contains("CREATE (post)-[:MENTION {position: 0}]->(user_2)"));
        assert!(cypher.contains("CREATE (post)-[:MENTION {position: 1}]->(user_2)"));
        assert!(cypher.contains("CREATE (post)-[:AUTHOR]->(user_1)"));
    }

    #[test]
    fn existing_users_only_get_missing_attributes() {
        let clause = merge_user_clause("user_1");
        assert!(clause.contains("ON MATCH SET user_1.display_name = coalesce(user_1.display_name, $user_1_display_name)"));
        assert!(clause.contains("ON CREATE SET user_1.display_name = $user_1_display_name"));
    }

    #[test]
    fn user_ids_are_returned_in_slot_order() {
        let cypher = upsert_cypher(&plan());
        assert!(cypher.ends_with("RETURN id(post) AS post_id, [id(user_1), id(user_2)] AS user_ids"));
    }
}
