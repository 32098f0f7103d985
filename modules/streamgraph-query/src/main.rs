use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use streamgraph_graph::{GraphClient, GraphReader};
use streamgraph_query::runner::{self, QueryStats, RunnerConfig};
use streamgraph_query::{GraphWorkload, QueryKind};

#[derive(Parser)]
#[command(name = "streamgraph-query")]
#[command(about = "Exercise graph read paths with sampled, shape-checked queries")]
#[command(version)]
struct Cli {
    /// Bolt address of a backend node; repeat or comma-separate for several
    #[arg(short, long, env = "STREAMGRAPH_BACKENDS", value_delimiter = ',', default_value = "bolt://127.0.0.1:7687")]
    backend: Vec<String>,

    #[arg(long, env = "NEO4J_USER", default_value = "neo4j")]
    neo4j_user: String,

    #[arg(long, env = "NEO4J_PASSWORD", default_value = "", hide_env_values = true)]
    neo4j_password: String,

    /// Queries in flight at once
    #[arg(short = 'q', long, default_value_t = 4)]
    concurrency: usize,

    /// Window, in hours, for the recent-only query kinds
    #[arg(long, default_value_t = 41)]
    recent_hours: i64,

    /// Seconds between STATS lines
    #[arg(long, default_value_t = 2)]
    report_secs: u64,
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

    let cli = Cli::parse();
    if cli.report_secs == 0 {
        anyhow::bail!("--report-secs must be at least 1");
    }
    let addresses: Vec<String> = cli
        .backend
        .iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    let clients = GraphClient::connect_all(&addresses, &cli.neo4j_user, &cli.neo4j_password)
        .await
        .context("Unable to connect to graph backend")?;
    let readers: Vec<GraphReader> = clients.into_iter().map(GraphReader::new).collect();
    info!(backends = readers.len(), "Connected");

    let workload = Arc::new(
        GraphWorkload::new(readers, cli.recent_hours).context("At least one backend address is required")?,
    );
    let stats = QueryStats::new();
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping query loops");
                shutdown.cancel();
            }
        });
    }

    let reporter = runner::spawn_reporter(
        stats.clone(),
        Duration::from_secs(cli.report_secs),
        shutdown.clone(),
    );
    let config = RunnerConfig {
        concurrency: cli.concurrency,
        ..RunnerConfig::default()
    };
    runner::run(workload, &QueryKind::ALL, config, stats.clone(), shutdown).await;
    let _ = reporter.await;

    info!("Final STATS {}", stats.snapshot());
    Ok(())
}
