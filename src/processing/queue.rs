//! Bounded hand-off from sync to the AI batch processor.
//!
//! Sync never waits on AI work: `try_enqueue` either places the batch on the
//! channel or drops it and counts the drop. Dropped batches stay indexed and
//! are not re-sent automatically.

use super::batch::{BatchProcessor, BatchResult};
use crate::mail::IndexedMessage;
use crate::monitoring::SyncMetrics;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProcessingJob {
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub messages: Vec<IndexedMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    DroppedFull,
    DroppedClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub capacity: usize,
    pub depth: usize,
    pub enqueued: u64,
    pub dropped: u64,
}

#[derive(Clone)]
pub struct ProcessingQueue {
    sender: mpsc::Sender<ProcessingJob>,
    capacity: usize,
    enqueued: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl ProcessingQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ProcessingJob>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let queue = Self {
            sender,
            capacity,
            enqueued: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            metrics: None,
        };
        (queue, receiver)
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn try_enqueue(&self, job: ProcessingJob) -> EnqueueOutcome {
        let account_id = job.account_id;
        let size = job.messages.len();

        let outcome = match self.sender.try_send(job) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                debug!(%account_id, size, "Batch queued for AI processing");
                EnqueueOutcome::Enqueued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%account_id, size, "Processing queue full, batch dropped");
                EnqueueOutcome::DroppedFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%account_id, size, "Processing queue closed, batch dropped");
                EnqueueOutcome::DroppedClosed
            }
        };

        if let Some(metrics) = &self.metrics {
            if outcome != EnqueueOutcome::Enqueued {
                metrics.processing_queue_dropped_total.inc();
            }
            metrics.processing_queue_depth.set(self.depth() as i64);
        }
        outcome
    }

    pub fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            capacity: self.capacity,
            depth: self.depth(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn publish_depth(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.processing_queue_depth.set(self.depth() as i64);
        }
    }
}

/// Drains the queue until shutdown is signalled or every sender is gone.
pub fn spawn_worker(
    queue: ProcessingQueue,
    mut receiver: mpsc::Receiver<ProcessingJob>,
    processor: Arc<BatchProcessor>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("AI processing worker started");
        loop {
            tokio::select! {
                job = receiver.recv() => match job {
                    Some(job) => {
                        queue.publish_depth();
                        let result = processor.process(job.user_id, job.account_id, job.messages).await;
                        if let Some(e) = result.failure() {
                            warn!(account_id = %result.account_id, batch_id = %result.batch_id, "{}", e);
                        }
                    }
                    None => break,
                },
                _ = shutdown.recv() => {
                    info!(pending = queue.depth(), "AI processing worker shutting down");
                    break;
                }
            }
        }
    })
}

/// Processes whatever is already queued, then returns. Used by one-shot CLI
/// runs that exit after a single sync.
pub async fn process_pending(
    receiver: &mut mpsc::Receiver<ProcessingJob>,
    processor: &BatchProcessor,
) -> Vec<BatchResult> {
    let mut results = Vec::new();
    while let Ok(job) = receiver.try_recv() {
        results.push(
            processor
                .process(job.user_id, job.account_id, job.messages)
                .await,
        );
    }
    results
}
