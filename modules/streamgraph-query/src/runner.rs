//! Drives a weighted mix of query loops under a global in-flight bound.
//!
//! Each loop prepares parameters for its kind, runs the prepared query
//! `runs_per_prepare` times, then prepares again, until shutdown.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queries::{QueryKind, Workload};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Queries in flight at once, prepares included.
    pub concurrency: usize,
    pub runs_per_prepare: usize,
    /// Pause after a failed prepare before trying again.
    pub prepare_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            runs_per_prepare: 100,
            prepare_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
pub struct QueryStats {
    success: AtomicU64,
    failures: AtomicU64,
}

impl QueryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, ok: bool) {
        let counter = if ok { &self.success } else { &self.failures };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStatsSnapshot {
    pub success: u64,
    pub failures: u64,
}

impl fmt::Display for QueryStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "success: {}, failures: {}", self.success, self.failures)
    }
}

/// Run every kind in `kinds` with `kind.weight()` concurrent loops until `shutdown`.
pub async fn run<W: Workload>(
    workload: Arc<W>,
    kinds: &[QueryKind],
    config: RunnerConfig,
    stats: Arc<QueryStats>,
    shutdown: CancellationToken,
) {
    let throttle = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut loops = JoinSet::new();
    for &kind in kinds {
        for _ in 0..kind.weight() {
            loops.spawn(query_loop(
                kind,
                workload.clone(),
                throttle.clone(),
                config.clone(),
                stats.clone(),
                shutdown.clone(),
            ));
        }
    }
    info!(loops = loops.len(), concurrency = config.concurrency, "Query loops started");

    while let Some(joined) = loops.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Query loop ended abnormally");
        }
    }
}

async fn query_loop<W: Workload>(
    kind: QueryKind,
    workload: Arc<W>,
    throttle: Arc<Semaphore>,
    config: RunnerConfig,
    stats: Arc<QueryStats>,
    shutdown: CancellationToken,
) {
    let name = kind.name();
    loop {
        let prepared = {
            let Some(_permit) = acquire(&throttle, &shutdown).await else {
                return;
            };
            workload.prepare(kind).await
        };
        let prepared = match prepared {
            Ok(p) => {
                stats.record(true);
                p
            }
            Err(e) => {
                stats.record(false);
                warn!(query = name, error = %e, "Parameter query failed");
                let stopped = tokio::select! {
                    _ = shutdown.cancelled() => true,
                    _ = tokio::time::sleep(config.prepare_backoff) => false,
                };
                if stopped {
                    return;
                }
                continue;
            }
        };

        for _ in 0..config.runs_per_prepare {
            let Some(_permit) = acquire(&throttle, &shutdown).await else {
                return;
            };
            match workload.run(&prepared).await {
                Ok(rows) => {
                    stats.record(true);
                    debug!(query = name, rows, "Query ok");
                }
                Err(e) => {
                    stats.record(false);
                    warn!(query = name, error = %e, "Query failed");
                }
            }
        }
    }
}

async fn acquire<'a>(throttle: &'a Semaphore, shutdown: &CancellationToken) -> Option<SemaphorePermit<'a>> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        permit = throttle.acquire() => permit.ok(),
    }
}

/// Log a STATS line with the query rate every `period` until `shutdown`.
pub fn spawn_reporter(stats: Arc<QueryStats>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        let mut last = stats.snapshot();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = stats.snapshot();
            let rate = (now.success - last.success) as f64 / period.as_secs_f64();
            info!(query_rate = format!("{rate:.1}/sec").as_str(), "STATS {now}");
            last = now;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::queries::QueryError;

    /// Counts calls and tracks the highest number of overlapping calls.
    #[derive(Default)]
    struct CountingWorkload {
        prepares: AtomicUsize,
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_prepare: bool,
    }

    impl CountingWorkload {
        async fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Workload for CountingWorkload {
        type Prepared = QueryKind;

        async fn prepare(&self, kind: QueryKind) -> Result<QueryKind, QueryError> {
            self.enter().await;
            self.prepares.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepare {
                return Err(QueryError::NoData("hashtags"));
            }
            Ok(kind)
        }

        async fn run(&self, _: &QueryKind) -> Result<usize, QueryError> {
            self.enter().await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn config(runs_per_prepare: usize) -> RunnerConfig {
        RunnerConfig {
            concurrency: 2,
            runs_per_prepare,
            prepare_backoff: Duration::from_millis(1),
        }
    }

    async fn run_for(workload: Arc<CountingWorkload>, config: RunnerConfig, millis: u64) -> QueryStatsSnapshot {
        let stats = QueryStats::new();
        let shutdown = CancellationToken::new();
        let stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                shutdown.cancel();
            })
        };
        run(workload, &QueryKind::ALL, config, stats.clone(), shutdown).await;
        stopper.await.unwrap();
        stats.snapshot()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_queries_never_exceed_concurrency() {
        let workload = Arc::new(CountingWorkload::default());
        let snap = run_for(workload.clone(), config(5), 100).await;

        assert!(workload.peak.load(Ordering::SeqCst) <= 2);
        assert!(snap.success > 0);
        assert_eq!(snap.failures, 0);
    }

    #[tokio::test]
    async fn each_prepare_is_followed_by_its_runs() {
        let workload = Arc::new(CountingWorkload::default());
        run_for(workload.clone(), config(3), 100).await;

        let prepares = workload.prepares.load(Ordering::SeqCst);
        let runs = workload.runs.load(Ordering::SeqCst);
        assert!(prepares > 0);
        assert!(runs <= prepares * 3);
    }

    #[tokio::test]
    async fn failed_prepares_are_counted_and_no_runs_happen() {
        let workload = Arc::new(CountingWorkload {
            fail_prepare: true,
            ..Default::default()
        });
        let snap = run_for(workload.clone(), config(3), 50).await;

        assert!(snap.failures > 0);
        assert_eq!(snap.success, 0);
        assert_eq!(workload.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stats_display() {
        let snap = QueryStatsSnapshot {
            success: 7,
            failures: 1,
        };
        assert_eq!(snap.to_string(), "success: 7, failures: 1");
    }
}
