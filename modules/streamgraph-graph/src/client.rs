use neo4rs::{ConfigBuilder, Graph};

/// Thin wrapper around neo4rs::Graph providing connection setup.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
}

impl GraphClient {
    /// Connect to a bolt endpoint with the given credentials.
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, neo4rs::Error> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .fetch_size(500)
            .max_connections(16)
            .build()?;
        let graph = Graph::connect(config).await?;
        Ok(Self { graph })
    }

    /// Connect to every address in the list, in order.
    pub async fn connect_all(
        addresses: &[String],
        user: &str,
        password: &str,
    ) -> Result<Vec<Self>, neo4rs::Error> {
        let mut clients = Vec::with_capacity(addresses.len());
        for uri in addresses {
            clients.push(Self::connect(uri, user, password).await?);
        }
        Ok(clients)
    }

    /// Get a reference to the underlying neo4rs Graph.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }
}
