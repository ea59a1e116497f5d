//! Background AI batch processor.
//!
//! Fans a freshly persisted batch out to the AI layer with bounded
//! concurrency. Each message succeeds or fails on its own; failures are
//! logged and counted, never propagated. Large enough batches leave an
//! advisory learning signal for the owning user.

use crate::ai::{AiError, AiLayer, ClassificationResult};
use crate::mail::{IndexedMessage, SyncError};
use crate::monitoring::SyncMetrics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Concurrent AI calls per batch.
    pub max_concurrency: usize,
    pub item_timeout_seconds: u64,
    /// Batches at least this large signal the learning scheduler.
    pub learning_signal_min_batch: usize,
    /// Capacity of the sync to processor hand-off queue, in batches.
    pub queue_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            item_timeout_seconds: 120,
            learning_signal_min_batch: 5,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_seconds: f64,
    pub learning_signalled: bool,
}

impl BatchResult {
    /// `PartialBatchFailure` when any item failed; the batch itself still
    /// counts as processed.
    pub fn failure(&self) -> Option<SyncError> {
        (self.failed > 0).then(|| SyncError::PartialBatchFailure {
            failed: self.failed,
            total: self.total,
        })
    }
}

/// Running totals since process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_batches: u64,
    pub total_items: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub avg_item_time_ms: f64,
    /// Exponential moving average over batches.
    pub success_rate: f32,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub error_counts: HashMap<String, u64>,
}

impl Default for ProcessingStats {
    fn default() -> Self {
        Self {
            total_batches: 0,
            total_items: 0,
            total_succeeded: 0,
            total_failed: 0,
            avg_item_time_ms: 0.0,
            success_rate: 1.0,
            last_processed_at: None,
            error_counts: HashMap::new(),
        }
    }
}

/// Users with fresh signal since the learning scheduler last looked.
#[derive(Debug, Clone, Default)]
pub struct LearningSignals {
    users: Arc<Mutex<HashSet<Uuid>>>,
}

impl LearningSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn signal(&self, user_id: Uuid) {
        self.users.lock().await.insert(user_id);
    }

    pub async fn contains(&self, user_id: Uuid) -> bool {
        self.users.lock().await.contains(&user_id)
    }

    pub async fn drain(&self) -> HashSet<Uuid> {
        std::mem::take(&mut *self.users.lock().await)
    }
}

pub struct BatchProcessor {
    ai: Arc<dyn AiLayer>,
    signals: LearningSignals,
    config: ProcessorConfig,
    stats: Arc<Mutex<ProcessingStats>>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl BatchProcessor {
    pub fn new(ai: Arc<dyn AiLayer>, signals: LearningSignals, config: ProcessorConfig) -> Self {
        Self {
            ai,
            signals,
            config,
            stats: Arc::new(Mutex::new(ProcessingStats::default())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    #[instrument(skip(self, messages), fields(batch_size = messages.len()))]
    pub async fn process(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        messages: Vec<IndexedMessage>,
    ) -> BatchResult {
        let started = Instant::now();
        let batch_id = Uuid::new_v4();
        let semaphore = Semaphore::new(self.config.max_concurrency.max(1));

        let results = join_all(messages.iter().map(|message| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| AiError::ServiceUnavailable(e.to_string()))?;
                self.classify_one(message).await
            }
        }))
        .await;

        let mut succeeded = 0;
        let mut errors_by_type: HashMap<String, u64> = HashMap::new();
        for (message, result) in messages.iter().zip(&results) {
            match result {
                Ok(classification) => {
                    succeeded += 1;
                    debug!(
                        indexed_message_id = %message.id,
                        category = %classification.category,
                        "Message classified"
                    );
                }
                Err(e) => {
                    warn!(indexed_message_id = %message.id, "AI processing failed: {}", e);
                    *errors_by_type.entry(error_type(e).to_string()).or_insert(0) += 1;
                }
            }
        }

        let total = messages.len();
        let failed = total - succeeded;
        let learning_signalled = total >= self.config.learning_signal_min_batch;
        if learning_signalled {
            self.signals.signal(user_id).await;
        }

        let elapsed = started.elapsed();
        self.record_stats(total, succeeded, elapsed, errors_by_type).await;

        if let Some(metrics) = &self.metrics {
            metrics
                .ai_items_total
                .with_label_values(&["succeeded"])
                .inc_by(succeeded as u64);
            metrics
                .ai_items_total
                .with_label_values(&["failed"])
                .inc_by(failed as u64);
        }

        info!(
            %batch_id,
            %account_id,
            total,
            succeeded,
            failed,
            learning_signalled,
            "AI batch processed in {:.2}s",
            elapsed.as_secs_f64()
        );

        BatchResult {
            batch_id,
            user_id,
            account_id,
            total,
            succeeded,
            failed,
            duration_seconds: elapsed.as_secs_f64(),
            learning_signalled,
        }
    }

    pub async fn get_stats(&self) -> ProcessingStats {
        self.stats.lock().await.clone()
    }

    async fn classify_one(&self, message: &IndexedMessage) -> Result<ClassificationResult, AiError> {
        let timeout = Duration::from_secs(self.config.item_timeout_seconds);
        tokio::time::timeout(timeout, self.ai.classify_and_draft(message))
            .await
            .map_err(|_| AiError::Timeout(self.config.item_timeout_seconds))?
    }

    async fn record_stats(
        &self,
        total: usize,
        succeeded: usize,
        elapsed: Duration,
        errors_by_type: HashMap<String, u64>,
    ) {
        if total == 0 {
            return;
        }

        let mut stats = self.stats.lock().await;
        stats.total_batches += 1;
        stats.total_items += total as u64;
        stats.total_succeeded += succeeded as u64;
        stats.total_failed += (total - succeeded) as u64;
        stats.last_processed_at = Some(Utc::now());

        let batch_rate = succeeded as f32 / total as f32;
        stats.success_rate = 0.9 * stats.success_rate + 0.1 * batch_rate;

        let per_item_ms = elapsed.as_secs_f64() * 1000.0 / total as f64;
        stats.avg_item_time_ms = if stats.total_batches == 1 {
            per_item_ms
        } else {
            0.9 * stats.avg_item_time_ms + 0.1 * per_item_ms
        };

        for (error_type, count) in errors_by_type {
            *stats.error_counts.entry(error_type).or_insert(0) += count;
        }
    }
}

fn error_type(error: &AiError) -> &'static str {
    match error {
        AiError::Timeout(_) => "timeout",
        AiError::ServiceUnavailable(_) => "service_unavailable",
        AiError::Rejected(_) => "rejected",
        AiError::MalformedResponse(_) => "malformed_response",
        AiError::HttpError(_) => "http_error",
        AiError::InvalidUrl(_) => "invalid_url",
    }
}
