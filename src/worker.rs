use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::time::sleep_until;

use crate::manager::Shutdown;
use crate::messages::Report;
use crate::queue::{Ack, Claim, DeliveryQueue, DeliveryTask, Requeue};

/// Every variant is retryable.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote rejected report with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl DeliveryError {
    /// Transport failures and 5xx answers mean the service itself is down. Any
    /// other rejection is about the payload.
    pub fn is_outage(&self) -> bool {
        match self {
            DeliveryError::Transport(_) => true,
            DeliveryError::Rejected { status, .. } => *status >= 500,
        }
    }
}

/// Sends one report to the remote presence service.
pub trait Reporter: Send + Sync + 'static {
    fn report(&self, report: &Report) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Whether the remote service answered the last delivery attempt.
///
/// Shared by all workers. A success after a failure signals recovery, which
/// the full-sync scheduler answers with a resync.
#[derive(Debug, Default)]
pub struct RemoteStatus {
    offline: AtomicBool,
    recovered: Notify,
}

impl RemoteStatus {
    /// Returns true if this failure took the remote offline.
    pub(crate) fn mark_failed(&self) -> bool {
        !self.offline.swap(true, Ordering::SeqCst)
    }

    /// Returns true if this success brought the remote back.
    pub(crate) fn mark_ok(&self) -> bool {
        let recovered = self.offline.swap(false, Ordering::SeqCst);
        if recovered {
            self.recovered.notify_one();
        }
        recovered
    }

    #[cfg(test)]
    pub(crate) fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Resolves after the remote comes back from an outage.
    pub async fn recovered(&self) {
        self.recovered.notified().await
    }
}

pub struct DeliveryWorker<R> {
    id: usize,
    queue: Arc<DeliveryQueue>,
    reporter: Arc<R>,
    status: Arc<RemoteStatus>,
}

impl<R: Reporter> DeliveryWorker<R> {
    pub fn new(
        id: usize,
        queue: Arc<DeliveryQueue>,
        reporter: Arc<R>,
        status: Arc<RemoteStatus>,
    ) -> Self {
        DeliveryWorker {
            id,
            queue,
            reporter,
            status,
        }
    }

    /// Drain the queue until shutdown. A delivery already in flight is
    /// finished (or times out) before the worker stops.
    pub async fn run(self, mut shutdown: Shutdown) {
        debug!("Delivery worker {} started", self.id);
        while !shutdown.is_triggered() {
            let changed = self.queue.changed();
            match self.queue.claim_next() {
                Claim::Ready(task) => self.deliver(task).await,
                Claim::Idle { wake_at } => {
                    let backoff = async {
                        match wake_at {
                            Some(at) => sleep_until(at).await,
                            None => futures::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        _ = changed => {}
                        _ = backoff => {}
                        _ = shutdown.wait() => {}
                    }
                }
            }
        }
        debug!("Delivery worker {} stopped", self.id);
    }

    pub async fn deliver(&self, task: DeliveryTask) {
        debug!(
            "Worker {} delivering {} (attempt {})",
            self.id,
            task.key,
            task.attempt_count + 1
        );

        match self.reporter.report(&task.report).await {
            Ok(()) => {
                if self.status.mark_ok() {
                    info!("Remote service is back online");
                }
                match self.queue.ack(&task.key, task.generation) {
                    Ack::Delivered => debug!("Delivered {}", task.key),
                    Ack::Superseded => {
                        debug!("Delivered stale payload for {}, newer one stays queued", task.key)
                    }
                    Ack::Unknown => debug!("{} is no longer queued", task.key),
                }
            }
            Err(err) => {
                if !err.is_outage() {
                    warn!("Remote rejected {}: {}", task.key, err);
                } else if self.status.mark_failed() {
                    warn!("Remote service seems to be offline: {}", err);
                } else {
                    debug!("Delivery of {} failed: {}", task.key, err);
                }
                match self.queue.requeue(&task.key, task.generation) {
                    Requeue::Retry { attempt, delay } => debug!(
                        "Retrying {} in {:?} (failed attempts: {})",
                        task.key, delay, attempt
                    ),
                    Requeue::Superseded => {
                        debug!("Failed payload for {} was superseded", task.key)
                    }
                    Requeue::Unknown => debug!("{} is no longer queued", task.key),
                }
            }
        }
    }
}
