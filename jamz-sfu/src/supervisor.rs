//! Worker liveness supervision
//!
//! One monitor task per worker. A worker that stops without the pool asking it
//! to is a death: its routers are gone and cannot be rebuilt in place, so the
//! monitor reports a [`FatalSignal`] on the control channel and the process is
//! expected to shut down after [`PoolConfig::death_grace_period`].
//!
//! [`PoolConfig::death_grace_period`]: crate::PoolConfig::death_grace_period

use crate::types::WorkerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Structured process-wide shutdown request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalSignal {
    WorkerDied { worker_id: WorkerId, reason: String },
}

impl std::fmt::Display for FatalSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerDied { worker_id, reason } => {
                write!(f, "media worker {worker_id} died: {reason}")
            }
        }
    }
}

pub type FatalSender = mpsc::UnboundedSender<FatalSignal>;
pub type FatalReceiver = mpsc::UnboundedReceiver<FatalSignal>;

/// Create the control channel the pool reports worker deaths on
#[must_use]
pub fn fatal_channel() -> (FatalSender, FatalReceiver) {
    mpsc::unbounded_channel()
}

pub(crate) fn monitor_worker(
    worker_id: WorkerId,
    join: JoinHandle<()>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
    fatal_tx: FatalSender,
) {
    tokio::spawn(async move {
        let outcome = join.await;
        alive.store(false, Ordering::Release);

        if cancel.is_cancelled() {
            debug!(worker_id = %worker_id, "Worker stopped");
            return;
        }

        let reason = match outcome {
            Ok(()) => "worker task exited unexpectedly".to_string(),
            Err(e) if e.is_panic() => "worker task panicked".to_string(),
            Err(e) if e.is_cancelled() => "worker task was killed".to_string(),
            Err(e) => format!("worker task failed: {e}"),
        };

        error!(
            worker_id = %worker_id,
            reason = %reason,
            "Media worker died, requesting process shutdown"
        );

        // Receiver gone means the process is already on its way down
        let _ = fatal_tx.send(FatalSignal::WorkerDied { worker_id, reason });
    });
}

/// Wait for the first fatal signal, then hold it for the grace period.
///
/// Returns `None` if every sender went away without reporting anything.
pub async fn await_fatal(receiver: &mut FatalReceiver, grace: Duration) -> Option<FatalSignal> {
    let signal = receiver.recv().await?;
    error!(
        signal = %signal,
        grace_ms = grace.as_millis() as u64,
        "Fatal condition, shutting down after grace period"
    );
    tokio::time::sleep(grace).await;
    Some(signal)
}
