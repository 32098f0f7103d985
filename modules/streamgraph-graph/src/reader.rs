use chrono::{DateTime, FixedOffset};
use neo4rs::{query, Query, Row};

use crate::GraphClient;

/// Read-only wrapper for the graph. Used by the query exerciser and by
/// integration tests that check what the pipeline committed.
#[derive(Clone)]
pub struct GraphReader {
    client: GraphClient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostRow {
    pub graph_id: String,
    pub external_id: String,
    pub created_at: Option<DateTime<FixedOffset>>,
    pub message: String,
    pub hashtags: Vec<String>,
    pub is_retweet: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
    pub graph_id: String,
    pub external_id: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
}

/// A user with the number of posts that matched a ranking query.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedUser {
    pub user: UserRow,
    pub count: i64,
}

const USER_COLUMNS: &str = "toString(id(u)) AS graph_id, u.external_id AS external_id, \
     u.handle AS handle, u.display_name AS display_name";

const POST_COLUMNS: &str = "toString(id(p)) AS graph_id, p.external_id AS external_id, \
     toString(p.created_at) AS created_at, p.message AS message, \
     p.hashtags AS hashtags, p.is_retweet AS is_retweet";

impl GraphReader {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    // --- Sampling (parameters for read queries) ---

    /// Distinct hashtags in the graph, paged by `offset`. With `since`, only
    /// hashtags of posts created at or after that instant.
    pub async fn sample_hashtags(
        &self,
        offset: i64,
        limit: i64,
        since: Option<DateTime<FixedOffset>>,
    ) -> Result<Vec<String>, neo4rs::Error> {
        let cypher = format!(
            "MATCH (p:Post) {}
             UNWIND p.hashtags AS tag
             WITH DISTINCT tag
             RETURN tag ORDER BY tag SKIP $offset LIMIT $limit",
            recency_filter("p", since)
        );
        self.strings(with_since(query(&cypher), since).param("offset", offset).param("limit", limit), "tag")
            .await
    }

    /// User handles, paged by `offset`. With `since`, only users who authored
    /// a post created at or after that instant.
    pub async fn sample_handles(
        &self,
        offset: i64,
        limit: i64,
        since: Option<DateTime<FixedOffset>>,
    ) -> Result<Vec<String>, neo4rs::Error> {
        let cypher = user_sample_cypher(since, "u.handle", "handle");
        self.strings(with_since(query(&cypher), since).param("offset", offset).param("limit", limit), "handle")
            .await
    }

    /// External ids of users that have a handle, paged by `offset`, optionally
    /// restricted to recent authors.
    pub async fn sample_user_ids(
        &self,
        offset: i64,
        limit: i64,
        since: Option<DateTime<FixedOffset>>,
    ) -> Result<Vec<String>, neo4rs::Error> {
        let cypher = user_sample_cypher(since, "u.external_id", "external_id");
        self.strings(with_since(query(&cypher), since).param("offset", offset).param("limit", limit), "external_id")
            .await
    }

    // --- Lookups ---

    pub async fn posts_with_hashtag(&self, tag: &str, limit: i64) -> Result<Vec<PostRow>, neo4rs::Error> {
        let cypher = format!(
            "MATCH (p:Post) WHERE $tag IN p.hashtags
             RETURN {POST_COLUMNS}
             ORDER BY p.created_at DESC LIMIT $limit"
        );
        let q = query(&cypher).param("tag", tag).param("limit", limit);

        let mut posts = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            posts.push(row_to_post(&row));
        }
        Ok(posts)
    }

    pub async fn post(&self, external_id: &str) -> Result<Option<PostRow>, neo4rs::Error> {
        let cypher = format!("MATCH (p:Post {{external_id: $id}}) RETURN {POST_COLUMNS}");
        let mut stream = self.client.graph.execute(query(&cypher).param("id", external_id)).await?;
        Ok(stream.next().await?.map(|row| row_to_post(&row)))
    }

    pub async fn users_by_handle(&self, handle: &str) -> Result<Vec<UserRow>, neo4rs::Error> {
        let cypher = format!("MATCH (u:User {{handle: $handle}}) RETURN {USER_COLUMNS}");
        self.users(query(&cypher).param("handle", handle)).await
    }

    pub async fn user(&self, external_id: &str) -> Result<Option<UserRow>, neo4rs::Error> {
        let cypher = format!("MATCH (u:User {{external_id: $id}}) RETURN {USER_COLUMNS}");
        let users = self.users(query(&cypher).param("id", external_id)).await?;
        Ok(users.into_iter().next())
    }

    // --- Rankings ---

    /// Users ordered by how many mention edges point at them.
    pub async fn most_mentioned(&self, limit: i64) -> Result<Vec<RankedUser>, neo4rs::Error> {
        let cypher = format!(
            "MATCH (:Post)-[:MENTION]->(u:User)
             WITH u, count(*) AS count
             RETURN {USER_COLUMNS}, count
             ORDER BY count DESC LIMIT $limit"
        );
        self.ranked(query(&cypher).param("limit", limit)).await
    }

    /// Users ordered by authored post count, optionally counting only recent posts.
    pub async fn most_prolific(
        &self,
        limit: i64,
        since: Option<DateTime<FixedOffset>>,
    ) -> Result<Vec<RankedUser>, neo4rs::Error> {
        let cypher = format!(
            "MATCH (p:Post)-[:AUTHOR]->(u:User) {}
             WITH u, count(p) AS count
             RETURN {USER_COLUMNS}, count
             ORDER BY count DESC LIMIT $limit",
            recency_filter("p", since)
        );
        self.ranked(with_since(query(&cypher), since).param("limit", limit)).await
    }

    // --- Topology ---

    /// External id of the author of a post.
    pub async fn author_of(&self, post_external_id: &str) -> Result<Option<UserRow>, neo4rs::Error> {
        let cypher = format!(
            "MATCH (:Post {{external_id: $id}})-[:AUTHOR]->(u:User) RETURN {USER_COLUMNS}"
        );
        let users = self.users(query(&cypher).param("id", post_external_id)).await?;
        Ok(users.into_iter().next())
    }

    /// Mentioned users of a post in mention order, repeats included.
    pub async fn mentions_of(&self, post_external_id: &str) -> Result<Vec<UserRow>, neo4rs::Error> {
        let cypher = format!(
            "MATCH (:Post {{external_id: $id}})-[m:MENTION]->(u:User)
             RETURN {USER_COLUMNS} ORDER BY m.position"
        );
        self.users(query(&cypher).param("id", post_external_id)).await
    }

    /// Number of nodes carrying `label` (`Post` or `User`).
    pub async fn count_nodes(&self, label: &str) -> Result<i64, neo4rs::Error> {
        let cypher = format!("MATCH (n:{label}) RETURN count(n) AS count");
        let mut stream = self.client.graph.execute(query(&cypher)).await?;
        match stream.next().await? {
            Some(row) => Ok(row.get("count").unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn strings(&self, q: Query, column: &str) -> Result<Vec<String>, neo4rs::Error> {
        let mut out = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            if let Ok(value) = row.get::<String>(column) {
                out.push(value);
            }
        }
        Ok(out)
    }

    async fn users(&self, q: Query) -> Result<Vec<UserRow>, neo4rs::Error> {
        let mut users = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            users.push(row_to_user(&row));
        }
        Ok(users)
    }

    async fn ranked(&self, q: Query) -> Result<Vec<RankedUser>, neo4rs::Error> {
        let mut ranked = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            ranked.push(RankedUser {
                user: row_to_user(&row),
                count: row.get("count").unwrap_or(0),
            });
        }
        Ok(ranked)
    }
}

fn recency_filter(var: &str, since: Option<DateTime<FixedOffset>>) -> String {
    match since {
        Some(_) => format!("WHERE {var}.created_at >= datetime($since)"),
        None => String::new(),
    }
}

fn users_matching(since: Option<DateTime<FixedOffset>>) -> String {
    match since {
        Some(_) => format!("MATCH (p:Post)-[:AUTHOR]->(u:User) {}", recency_filter("p", since)),
        None => "MATCH (u:User)".to_string(),
    }
}

/// One distinct `expr` per handled user, sorted and paged.
fn user_sample_cypher(since: Option<DateTime<FixedOffset>>, expr: &str, alias: &str) -> String {
    format!(
        "{}
         WITH DISTINCT u WHERE u.handle IS NOT NULL
         WITH DISTINCT {expr} AS {alias}
         RETURN {alias} ORDER BY {alias} SKIP $offset LIMIT $limit",
        users_matching(since)
    )
}

fn with_since(q: Query, since: Option<DateTime<FixedOffset>>) -> Query {
    match since {
        Some(ts) => q.param("since", ts.to_rfc3339()),
        None => q,
    }
}

fn row_to_user(row: &Row) -> UserRow {
    UserRow {
        graph_id: row.get("graph_id").unwrap_or_default(),
        external_id: row.get("external_id").unwrap_or_default(),
        handle: row.get::<String>("handle").ok(),
        display_name: row.get::<String>("display_name").ok(),
    }
}

fn row_to_post(row: &Row) -> PostRow {
    let created_at = row
        .get::<String>("created_at")
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok());
    PostRow {
        graph_id: row.get("graph_id").unwrap_or_default(),
        external_id: row.get("external_id").unwrap_or_default(),
        created_at,
        message: row.get("message").unwrap_or_default(),
        hashtags: row.get("hashtags").unwrap_or_default(),
        is_retweet: row.get("is_retweet").unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cutoff_means_no_filter() {
        assert_eq!(recency_filter("p", None), "");
        assert_eq!(users_matching(None), "MATCH (u:User)");
    }

    #[test]
    fn cutoff_restricts_to_recent_authors() {
        let since = DateTime::parse_from_rfc3339("2018-10-10T00:00:00+00:00").unwrap();
        assert_eq!(
            users_matching(Some(since)),
            "MATCH (p:Post)-[:AUTHOR]->(u:User) WHERE p.created_at >= datetime($since)"
        );
    }

    #[test]
    fn sampled_users_always_have_a_handle() {
        let since = DateTime::parse_from_rfc3339("2018-10-10T00:00:00+00:00").unwrap();
        for (expr, alias) in [("u.handle", "handle"), ("u.external_id", "external_id")] {
            let all = user_sample_cypher(None, expr, alias);
            assert!(all.contains("WHERE u.handle IS NOT NULL"));
            assert_eq!(all.matches("WHERE").count(), 1);
            assert!(all.contains(&format!("WITH DISTINCT {expr} AS {alias}")));

            let recent = user_sample_cypher(Some(since), expr, alias);
            assert!(recent.contains("WHERE u.handle IS NOT NULL"));
            assert_eq!(recent.matches("WHERE").count(), 2);
        }
    }
}
