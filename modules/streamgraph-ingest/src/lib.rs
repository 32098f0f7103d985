pub mod app;
pub mod archive;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod normalize;
pub mod source;
pub mod stats;
pub mod worker;

pub use app::{run, run_with_backends};
pub use error::StreamGraphError;
pub use executor::{CommitOutcome, Executor, FailureKind, RetryPolicy};
pub use normalize::{normalize, NormalizeError};
pub use stats::{IngestStats, StatsSnapshot};
pub use worker::{RecordHandler, RecordPipeline};
