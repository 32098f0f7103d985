use std::path::PathBuf;

use thiserror::Error;

/// Fatal startup errors. Any of these aborts the process before a record is processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to open credentials file '{}'", path.display())]
    CredentialsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to parse credentials file '{}'", path.display())]
    CredentialsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Credentials file '{}' has no bearer_token", path.display())]
    MissingBearerToken { path: PathBuf },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
