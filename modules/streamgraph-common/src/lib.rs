pub mod config;
pub mod error;
pub mod types;

pub use config::{Credentials, GraphConfig, IngestConfig, InputSource};
pub use error::ConfigError;
pub use types::*;
