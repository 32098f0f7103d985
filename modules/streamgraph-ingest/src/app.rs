//! Wires config, source, dispatcher and reporter into one ingestion run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use streamgraph_common::{ConfigError, Credentials, IngestConfig, InputSource, StreamMessage};
use streamgraph_graph::migrate::ensure_schema;
use streamgraph_graph::{BackendError, GraphBackend, GraphClient, GraphWriter, MemoryGraph};

use crate::archive::ArchiveWriter;
use crate::dispatcher;
use crate::error::StreamGraphError;
use crate::executor::RetryPolicy;
use crate::source::{self, SourceError};
use crate::stats::{self, IngestStats, StatsSnapshot};
use crate::worker::{RecordHandler, RecordPipeline};

pub const SCHEMA_ATTEMPTS: u32 = 3;
pub const SCHEMA_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Input resolved at startup, secrets loaded.
enum Feed {
    Live { url: String, bearer_token: String },
    Files(PathBuf),
}

impl Feed {
    fn prepare(input: &InputSource) -> Result<Self, ConfigError> {
        match input {
            InputSource::Live { url, credentials } => Ok(Feed::Live {
                url: url.clone(),
                bearer_token: Credentials::load(credentials)?.bearer_token,
            }),
            InputSource::Files(path) if path.exists() => Ok(Feed::Files(path.clone())),
            InputSource::Files(path) => Err(ConfigError::Invalid {
                field: "input",
                reason: format!("'{}' does not exist", path.display()),
            }),
        }
    }

    async fn pump(
        self,
        tx: mpsc::Sender<StreamMessage>,
        stats: Arc<IngestStats>,
        shutdown: CancellationToken,
    ) -> Result<u64, SourceError> {
        match self {
            Feed::Live { url, bearer_token } => {
                source::read_live(&url, &bearer_token, tx, &stats, shutdown).await
            }
            Feed::Files(path) => source::read_files(&path, tx, &stats, shutdown).await,
        }
    }
}

/// Run ingestion (or archiving) until the input is exhausted or `shutdown` fires.
pub async fn run(config: IngestConfig, shutdown: CancellationToken) -> Result<StatsSnapshot, StreamGraphError> {
    config.validate()?;
    config.log_redacted();

    if config.archive_dir.is_some() {
        return run_archive(config, shutdown).await;
    }

    let backends: Vec<Arc<dyn GraphBackend>> = if config.dry_run {
        warn!("Dry run: writing to an in-memory graph, nothing is persisted");
        vec![Arc::new(MemoryGraph::new())]
    } else {
        let g = &config.graph;
        GraphClient::connect_all(&g.addresses, &g.user, &g.password)
            .await
            .map_err(|e| StreamGraphError::Connect(BackendError::from(e)))?
            .into_iter()
            .map(|client| Arc::new(GraphWriter::new(client)) as Arc<dyn GraphBackend>)
            .collect()
    };

    run_with_backends(config, backends, RetryPolicy::default(), shutdown).await
}

/// Ingest into the given backends. Worker `i` writes through `backends[i % n]`.
pub async fn run_with_backends(
    config: IngestConfig,
    backends: Vec<Arc<dyn GraphBackend>>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) -> Result<StatsSnapshot, StreamGraphError> {
    let feed = Feed::prepare(&config.input)?;

    let primary = backends.first().ok_or(ConfigError::Invalid {
        field: "backend",
        reason: "at least one backend is required".into(),
    })?;
    ensure_schema(primary.as_ref(), SCHEMA_ATTEMPTS, SCHEMA_RETRY_DELAY)
        .await
        .map_err(StreamGraphError::Schema)?;
    info!(backends = backends.len(), "Schema ready");

    let stats = IngestStats::new();
    let handlers: Vec<Arc<dyn RecordHandler>> = backends
        .into_iter()
        .map(|backend| {
            Arc::new(RecordPipeline::new(
                backend,
                policy.clone(),
                config.defer_ratio,
                stats.clone(),
            )) as Arc<dyn RecordHandler>
        })
        .collect();

    Ok(drive(&config, feed, handlers, stats, shutdown).await)
}

async fn run_archive(config: IngestConfig, shutdown: CancellationToken) -> Result<StatsSnapshot, StreamGraphError> {
    let feed = Feed::prepare(&config.input)?;
    let Some(dir) = config.archive_dir.as_deref() else {
        return Err(ConfigError::Invalid {
            field: "archive-dir",
            reason: "not set".into(),
        }
        .into());
    };

    let stats = IngestStats::new();
    let writer = Arc::new(
        ArchiveWriter::open(dir, config.max_file_bytes, config.gzip, stats.clone())
            .await
            .map_err(StreamGraphError::Archive)?,
    );
    let handlers: Vec<Arc<dyn RecordHandler>> = vec![writer.clone()];

    let snapshot = drive(&config, feed, handlers, stats, shutdown).await;
    if let Err(e) = writer.finish().await {
        error!(error = %e, "Failed to finish archive file");
    }
    Ok(snapshot)
}

async fn drive(
    config: &IngestConfig,
    feed: Feed,
    handlers: Vec<Arc<dyn RecordHandler>>,
    stats: Arc<IngestStats>,
    shutdown: CancellationToken,
) -> StatsSnapshot {
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let reporter_stop = CancellationToken::new();
    let reporter = stats::spawn_reporter(stats.clone(), config.report_period, reporter_stop.clone());
    let source = tokio::spawn(feed.pump(tx, stats.clone(), shutdown.clone()));

    dispatcher::run(rx, handlers, config.workers, shutdown).await;

    match source.await {
        Ok(Ok(lines)) => info!(lines, "Source finished"),
        Ok(Err(e)) => error!(error = %e, cause = ?std::error::Error::source(&e), "Source failed"),
        Err(e) => error!(error = %e, "Source task panicked"),
    }

    reporter_stop.cancel();
    let _ = reporter.await;

    let snapshot = stats.snapshot();
    info!("Final STATS {snapshot}");
    snapshot
}
