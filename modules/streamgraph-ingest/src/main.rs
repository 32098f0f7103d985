use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use streamgraph_common::config::DEFAULT_STREAM_URL;
use streamgraph_common::{GraphConfig, IngestConfig, InputSource};

#[derive(Parser)]
#[command(name = "streamgraph-ingest")]
#[command(about = "Ingest a post stream into a graph database")]
#[command(version)]
struct Cli {
    /// Number of concurrent workers
    #[arg(short, long, env = "STREAMGRAPH_WORKERS", default_value_t = 8)]
    workers: usize,

    /// Credentials file (JSON with bearer_token) for the live stream
    #[arg(short, long, default_value = "credentials.json")]
    credentials: PathBuf,

    /// Bolt address of a backend node; repeat or comma-separate for several
    #[arg(short, long, env = "STREAMGRAPH_BACKENDS", value_delimiter = ',', default_value = "bolt://127.0.0.1:7687")]
    backend: Vec<String>,

    #[arg(long, env = "NEO4J_USER", default_value = "neo4j")]
    neo4j_user: String,

    #[arg(long, env = "NEO4J_PASSWORD", default_value = "", hide_env_values = true)]
    neo4j_password: String,

    /// Read posts from a JSON-lines file or directory instead of the live stream
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Live stream endpoint
    #[arg(long, env = "STREAMGRAPH_STREAM_URL", default_value = DEFAULT_STREAM_URL)]
    stream_url: String,

    /// Fraction of records sent without commit-now (rolled back, not durable)
    #[arg(long, default_value_t = 0.0)]
    defer_ratio: f64,

    /// Seconds between STATS lines
    #[arg(long, default_value_t = 2)]
    report_secs: u64,

    /// Inbound channel capacity
    #[arg(long, default_value_t = 1024)]
    channel_capacity: usize,

    /// Archive posts into this directory instead of inserting them
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Size at which archive files rotate
    #[arg(long, default_value_t = 100)]
    max_file_mb: u64,

    /// Gzip archive files (`.posts.jsonl.gz`)
    #[arg(long)]
    gzip: bool,

    /// Write into an in-memory graph instead of a backend
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn into_config(self) -> Result<IngestConfig> {
        let input = match self.input {
            Some(path) => InputSource::Files(path),
            None => InputSource::Live {
                url: self.stream_url,
                credentials: self.credentials,
            },
        };
        Ok(IngestConfig {
            graph: GraphConfig::new(self.backend, self.neo4j_user, self.neo4j_password)?,
            input,
            workers: self.workers,
            defer_ratio: self.defer_ratio,
            report_period: Duration::from_secs(self.report_secs),
            channel_capacity: self.channel_capacity,
            archive_dir: self.archive_dir,
            max_file_bytes: self.max_file_mb.saturating_mul(1 << 20),
            gzip: self.gzip,
            dry_run: self.dry_run,
        })
    }
}

fn main() -> ExitCode {
    // Load environment variables
    let _ = dotenvy::dotenv();

    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("streamgraph=info".parse()?))
        .init();

    let config = Cli::parse().into_config()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight records");
                shutdown.cancel();
            }
        });
    }

    let stats = streamgraph_ingest::run(config, shutdown).await?;
    info!(committed = stats.committed, failed = stats.failed(), "Done");
    Ok(())
}
