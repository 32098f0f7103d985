use std::time::Duration;

use neo4rs::query;
use tracing::{info, warn};

use crate::backend::{BackendError, GraphBackend};
use crate::GraphClient;

/// Run idempotent schema migrations: uniqueness constraints on the natural keys,
/// property indexes for the read paths.
pub async fn migrate(client: &GraphClient) -> Result<(), neo4rs::Error> {
    let g = &client.graph;

    info!("Running schema migrations...");

    // --- Natural key uniqueness ---
    let constraints = [
        "CREATE CONSTRAINT post_external_id IF NOT EXISTS FOR (p:Post) REQUIRE p.external_id IS UNIQUE",
        "CREATE CONSTRAINT user_external_id IF NOT EXISTS FOR (u:User) REQUIRE u.external_id IS UNIQUE",
    ];

    for c in &constraints {
        run_ignoring_exists(g, c).await?;
    }
    info!("External id uniqueness constraints created");

    // --- Property indexes ---
    let indexes = [
        "CREATE INDEX user_handle IF NOT EXISTS FOR (u:User) ON (u.handle)",
        "CREATE INDEX user_display_name IF NOT EXISTS FOR (u:User) ON (u.display_name)",
        "CREATE INDEX post_created_at IF NOT EXISTS FOR (p:Post) ON (p.created_at)",
        "CREATE INDEX post_hashtags IF NOT EXISTS FOR (p:Post) ON (p.hashtags)",
    ];

    for idx in &indexes {
        run_ignoring_exists(g, idx).await?;
    }
    info!("Property indexes created");

    info!("Schema migration complete");
    Ok(())
}

/// Declare the schema, retrying a bounded number of times before giving up.
pub async fn ensure_schema(
    backend: &dyn GraphBackend,
    attempts: u32,
    delay: Duration,
) -> Result<(), BackendError> {
    let mut attempt = 1;
    loop {
        match backend.alter_schema().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, "Schema alteration failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run a Cypher statement, ignoring errors that indicate the constraint/index already exists.
async fn run_ignoring_exists(g: &neo4rs::Graph, cypher: &str) -> Result<(), neo4rs::Error> {
    match g.run(query(cypher)).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            if msg.contains("already exists") || msg.contains("equivalent") {
                warn!("Already exists (skipped): {}", cypher.chars().take(80).collect::<String>());
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}
