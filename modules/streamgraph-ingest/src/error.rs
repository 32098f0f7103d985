use thiserror::Error;

use streamgraph_common::ConfigError;
use streamgraph_graph::BackendError;

/// Startup failures. Everything after startup is logged and counted instead.
#[derive(Error, Debug)]
pub enum StreamGraphError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unable to connect to graph backend")]
    Connect(#[source] BackendError),

    #[error("Schema alteration failed")]
    Schema(#[source] BackendError),

    #[error("Unable to open archive directory")]
    Archive(#[source] std::io::Error),
}
