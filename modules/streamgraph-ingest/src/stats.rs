//! Pipeline counters and the periodic STATS reporter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::executor::{CommitOutcome, FailureKind};

/// Shared counters. Workers update them with relaxed atomic increments; no locks.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    committed: AtomicU64,
    deferred: AtomicU64,
    duplicates: AtomicU64,
    conflict_retries: AtomicU64,
    failed_transient: AtomicU64,
    failed_reuse: AtomicU64,
    failed_conflict: AtomicU64,
    failed_other: AtomicU64,
    archived: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A message was taken off the channel.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// A message that was not a post.
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Unusable input: undecodable line or malformed post.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_retry(&self) {
        self.conflict_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archived(&self) {
        self.archived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &CommitOutcome) {
        let counter = match outcome {
            CommitOutcome::Committed => &self.committed,
            CommitOutcome::CommittedDeferred => &self.deferred,
            CommitOutcome::SkippedDuplicate => &self.duplicates,
            CommitOutcome::Failed(FailureKind::Transient) => &self.failed_transient,
            CommitOutcome::Failed(FailureKind::TransactionReuse) => &self.failed_reuse,
            CommitOutcome::Failed(FailureKind::Conflict) => &self.failed_conflict,
            CommitOutcome::Failed(FailureKind::Other) => &self.failed_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: get(&self.received),
            skipped: get(&self.skipped),
            rejected: get(&self.rejected),
            committed: get(&self.committed),
            deferred: get(&self.deferred),
            duplicates: get(&self.duplicates),
            conflict_retries: get(&self.conflict_retries),
            failed_transient: get(&self.failed_transient),
            failed_reuse: get(&self.failed_reuse),
            failed_conflict: get(&self.failed_conflict),
            failed_other: get(&self.failed_other),
            archived: get(&self.archived),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub committed: u64,
    pub deferred: u64,
    pub duplicates: u64,
    pub conflict_retries: u64,
    pub failed_transient: u64,
    pub failed_reuse: u64,
    pub failed_conflict: u64,
    pub failed_other: u64,
    pub archived: u64,
}

impl StatsSnapshot {
    /// Records that were dropped: rejected input plus every failed commit.
    pub fn failed(&self) -> u64 {
        self.rejected
            + self.failed_transient
            + self.failed_reuse
            + self.failed_conflict
            + self.failed_other
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received: {}, committed: {}, deferred: {}, duplicates: {}, skipped: {}, failed: {} \
             (rejected {}, unavailable {}, conflict {}, reuse {}, other {}), conflict retries: {}",
            self.received,
            self.committed,
            self.deferred,
            self.duplicates,
            self.skipped,
            self.failed(),
            self.rejected,
            self.failed_transient,
            self.failed_conflict,
            self.failed_reuse,
            self.failed_other,
            self.conflict_retries,
        )?;
        if self.archived > 0 {
            write!(f, ", archived: {}", self.archived)?;
        }
        Ok(())
    }
}

/// Log a STATS line every `period` until `shutdown` is cancelled.
pub fn spawn_reporter(
    stats: Arc<IngestStats>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        let mut last = stats.snapshot();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = stats.snapshot();
            let written = |s: &StatsSnapshot| s.committed + s.deferred + s.archived;
            let rate = (written(&now) - written(&last)) as f64 / period.as_secs_f64();
            info!(
                elapsed_secs = started.elapsed().as_secs(),
                rate_per_sec = format!("{rate:.1}").as_str(),
                "STATS {now}"
            );
            last = now;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_land_in_their_own_counter() {
        let stats = IngestStats::default();
        stats.record_outcome(&CommitOutcome::Committed);
        stats.record_outcome(&CommitOutcome::Committed);
        stats.record_outcome(&CommitOutcome::CommittedDeferred);
        stats.record_outcome(&CommitOutcome::SkippedDuplicate);
        stats.record_outcome(&CommitOutcome::Failed(FailureKind::Conflict));

        let snap = stats.snapshot();
        assert_eq!(snap.committed, 2);
        assert_eq!(snap.deferred, 1);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.failed_conflict, 1);
        assert_eq!(snap.failed(), 1);
    }

    #[test]
    fn rejected_input_counts_as_failure_but_skips_do_not() {
        let stats = IngestStats::default();
        stats.record_rejected();
        stats.record_skipped();
        let snap = stats.snapshot();
        assert_eq!(snap.failed(), 1);
        assert_eq!(snap.skipped, 1);
    }

    #[test]
    fn display_is_a_single_line() {
        let snap = StatsSnapshot {
            committed: 3,
            ..Default::default()
        };
        let line = snap.to_string();
        assert!(line.starts_with("received: 0, committed: 3"));
        assert!(!line.contains('\n'));
        assert!(!line.contains("archived"));
    }
}
