use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;

/// Default live endpoint: the public sampled post stream.
pub const DEFAULT_STREAM_URL: &str = "https://stream.twitter.com/1.1/statuses/sample.json";

/// API credentials for the upstream stream, read from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub access_secret: String,
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default)]
    pub bearer_token: String,
}

impl Credentials {
    /// Load and check credentials. The live stream authenticates with the bearer token,
    /// so a file without one is rejected up front.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::CredentialsRead {
            path: path.to_path_buf(),
            source,
        })?;
        let creds: Credentials =
            serde_json::from_str(&raw).map_err(|source| ConfigError::CredentialsParse {
                path: path.to_path_buf(),
                source,
            })?;
        if creds.bearer_token.trim().is_empty() {
            return Err(ConfigError::MissingBearerToken {
                path: path.to_path_buf(),
            });
        }
        Ok(creds)
    }
}

/// Connection settings for the graph backend.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// One bolt URI per backend node. Workers are spread across them round-robin.
    pub addresses: Vec<String>,
    pub user: String,
    pub password: String,
}

impl GraphConfig {
    pub fn new(addresses: Vec<String>, user: String, password: String) -> Result<Self, ConfigError> {
        let addresses: Vec<String> = addresses
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if addresses.is_empty() {
            return Err(ConfigError::Invalid {
                field: "backend",
                reason: "at least one backend address is required".into(),
            });
        }
        Ok(Self {
            addresses,
            user,
            password,
        })
    }
}

/// Where inbound messages come from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Live HTTP stream, authenticated with the credentials file.
    Live { url: String, credentials: PathBuf },
    /// A JSON-lines file, or a directory walked recursively.
    Files(PathBuf),
}

/// Validated settings for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub graph: GraphConfig,
    pub input: InputSource,
    pub workers: usize,
    /// Probability in [0, 1] that a record is sent without commit-now.
    pub defer_ratio: f64,
    pub report_period: Duration,
    pub channel_capacity: usize,
    /// When set, posts are archived to this directory instead of inserted.
    pub archive_dir: Option<PathBuf>,
    /// Uncompressed bytes per archive file before it rotates.
    pub max_file_bytes: u64,
    /// Gzip archive files.
    pub gzip: bool,
    /// Use the in-memory graph instead of a real backend.
    pub dry_run: bool,
}

impl IngestConfig {
    /// Check ranges that clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.defer_ratio) {
            return Err(ConfigError::Invalid {
                field: "defer-ratio",
                reason: format!("{} is outside 0.0..=1.0", self.defer_ratio),
            });
        }
        if self.report_period.is_zero() {
            return Err(ConfigError::Invalid {
                field: "report-secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel-capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.archive_dir.is_some() && self.max_file_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max-file-mb",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        let input = match &self.input {
            InputSource::Live { url, .. } => url.clone(),
            InputSource::Files(path) => path.display().to_string(),
        };
        let password = if self.graph.password.is_empty() {
            "<empty>"
        } else {
            "<redacted>"
        };
        info!(
            backends = ?self.graph.addresses,
            neo4j_user = self.graph.user.as_str(),
            neo4j_password = password,
            input = input.as_str(),
            workers = self.workers,
            defer_ratio = self.defer_ratio,
            dry_run = self.dry_run,
            archive_dir = ?self.archive_dir,
            gzip = self.gzip,
            "Configuration loaded"
        );
        if self.gzip && self.archive_dir.is_none() {
            warn!("--gzip only applies to archive mode and is ignored");
        }
        if self.defer_ratio > 0.0 && self.archive_dir.is_none() {
            warn!(
                defer_ratio = self.defer_ratio,
                "Deferred records are rolled back, never committed: they are not durable"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn config() -> IngestConfig {
        IngestConfig {
            graph: GraphConfig::new(vec!["bolt://localhost:7687".into()], "neo4j".into(), String::new())
                .unwrap(),
            input: InputSource::Files(PathBuf::from("posts.jsonl")),
            workers: 4,
            defer_ratio: 0.0,
            report_period: Duration::from_secs(2),
            channel_capacity: 64,
            archive_dir: None,
            max_file_bytes: 100 << 20,
            gzip: false,
            dry_run: false,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn defer_ratio_out_of_range_is_rejected() {
        let mut c = config();
        c.defer_ratio = 1.5;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid { field: "defer-ratio", .. })
        ));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut c = config();
        c.workers = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn blank_backend_addresses_are_rejected() {
        let err = GraphConfig::new(vec![" ".into(), String::new()], "neo4j".into(), String::new());
        assert!(err.is_err());
    }

    #[test]
    fn credentials_require_bearer_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"access_token":"a","access_secret":"b"}}"#).unwrap();
        let err = Credentials::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBearerToken { .. }));
    }

    #[test]
    fn credentials_load_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"bearer_token":"tok","consumer_key":"k"}}"#).unwrap();
        let creds = Credentials::load(file.path()).unwrap();
        assert_eq!(creds.bearer_token, "tok");
        assert_eq!(creds.consumer_key, "k");
    }

    #[test]
    fn missing_credentials_file_is_a_read_error() {
        let err = Credentials::load(Path::new("/nonexistent/credentials.json")).unwrap_err();
        assert!(matches!(err, ConfigError::CredentialsRead { .. }));
    }
}
