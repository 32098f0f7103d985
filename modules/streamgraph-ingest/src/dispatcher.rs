//! Worker pool over a single shared inbound channel.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use streamgraph_common::StreamMessage;

use crate::worker::RecordHandler;

/// Run `workers` tasks that each pull the next message and handle it to completion
/// before pulling another. Worker `i` uses `handlers[i % handlers.len()]`.
///
/// Returns when the channel is drained and closed, or when `shutdown` is cancelled.
/// Cancellation is only observed between records: in-flight records finish first.
pub async fn run<H>(
    rx: mpsc::Receiver<StreamMessage>,
    handlers: Vec<Arc<H>>,
    workers: usize,
    shutdown: CancellationToken,
) where
    H: RecordHandler + ?Sized + 'static,
{
    if handlers.is_empty() {
        warn!("No record handlers configured, nothing to run");
        return;
    }

    let rx = Arc::new(Mutex::new(rx));
    let mut pool = JoinSet::new();
    for id in 0..workers.max(1) {
        let handler = handlers[id % handlers.len()].clone();
        pool.spawn(worker(id, rx.clone(), handler, shutdown.clone()));
    }
    info!(workers = pool.len(), "Dispatcher started");

    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }
    info!("Dispatcher stopped");
}

async fn worker<H>(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<StreamMessage>>>,
    handler: Arc<H>,
    shutdown: CancellationToken,
) where
    H: RecordHandler + ?Sized,
{
    loop {
        // Lock receiver, grab one message, release lock immediately
        let next = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                message = guard.recv() => message,
            }
        };

        let Some(message) = next else {
            break;
        };
        handler.handle(message).await;
    }
    tracing::debug!(worker = id, "Worker exiting");
}
