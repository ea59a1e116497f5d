use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Prometheus collectors for sync, processing, learning and notifications.
pub struct SyncMetrics {
    registry: Arc<Registry>,

    // Sync
    pub sync_runs_total: IntCounter,
    pub sync_run_duration_seconds: Histogram,
    pub accounts_synced_total: IntCounterVec,
    pub messages_indexed_total: IntCounter,
    pub duplicates_discarded_total: IntCounter,
    pub duplicate_rows_reconciled_total: IntCounter,

    // Processing hand-off
    pub processing_queue_depth: IntGauge,
    pub processing_queue_dropped_total: IntCounter,
    pub ai_items_total: IntCounterVec,

    // Learning and notifications
    pub learning_users_total: IntCounterVec,
    pub notifications_sent_total: IntCounterVec,

    // Scheduler
    pub job_runs_total: IntCounterVec,
    pub job_ticks_skipped_total: IntCounterVec,
}

impl SyncMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let sync_runs_total = IntCounter::with_opts(Opts::new(
            "mailflow_sync_runs_total",
            "Total number of sync runs started",
        ))?;
        registry.register(Box::new(sync_runs_total.clone()))?;

        let sync_run_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "mailflow_sync_run_duration_seconds",
                "Duration of sync runs in seconds",
            )
            .buckets(exponential_buckets(0.05, 2.0, 14)?),
        )?;
        registry.register(Box::new(sync_run_duration_seconds.clone()))?;

        let accounts_synced_total = IntCounterVec::new(
            Opts::new(
                "mailflow_accounts_synced_total",
                "Per-account sync outcomes by status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(accounts_synced_total.clone()))?;

        let messages_indexed_total = IntCounter::with_opts(Opts::new(
            "mailflow_messages_indexed_total",
            "New messages persisted by sync",
        ))?;
        registry.register(Box::new(messages_indexed_total.clone()))?;

        let duplicates_discarded_total = IntCounter::with_opts(Opts::new(
            "mailflow_duplicates_discarded_total",
            "Incoming messages discarded as duplicates",
        ))?;
        registry.register(Box::new(duplicates_discarded_total.clone()))?;

        let duplicate_rows_reconciled_total = IntCounter::with_opts(Opts::new(
            "mailflow_duplicate_rows_reconciled_total",
            "Persisted duplicate rows removed by reconciliation",
        ))?;
        registry.register(Box::new(duplicate_rows_reconciled_total.clone()))?;

        let processing_queue_depth = IntGauge::with_opts(Opts::new(
            "mailflow_processing_queue_depth",
            "Batches waiting for AI processing",
        ))?;
        registry.register(Box::new(processing_queue_depth.clone()))?;

        let processing_queue_dropped_total = IntCounter::with_opts(Opts::new(
            "mailflow_processing_queue_dropped_total",
            "Batches dropped because the processing queue was full",
        ))?;
        registry.register(Box::new(processing_queue_dropped_total.clone()))?;

        let ai_items_total = IntCounterVec::new(
            Opts::new(
                "mailflow_ai_items_total",
                "Messages sent through classification by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(ai_items_total.clone()))?;

        let learning_users_total = IntCounterVec::new(
            Opts::new(
                "mailflow_learning_users_total",
                "Per-user learning outcomes by status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(learning_users_total.clone()))?;

        let notifications_sent_total = IntCounterVec::new(
            Opts::new(
                "mailflow_notifications_sent_total",
                "Notifications claimed and sent by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(notifications_sent_total.clone()))?;

        let job_runs_total = IntCounterVec::new(
            Opts::new("mailflow_job_runs_total", "Scheduled job executions"),
            &["job", "result"],
        )?;
        registry.register(Box::new(job_runs_total.clone()))?;

        let job_ticks_skipped_total = IntCounterVec::new(
            Opts::new(
                "mailflow_job_ticks_skipped_total",
                "Scheduler ticks skipped because the previous run was still executing",
            ),
            &["job"],
        )?;
        registry.register(Box::new(job_ticks_skipped_total.clone()))?;

        Ok(Self {
            registry,
            sync_runs_total,
            sync_run_duration_seconds,
            accounts_synced_total,
            messages_indexed_total,
            duplicates_discarded_total,
            duplicate_rows_reconciled_total,
            processing_queue_depth,
            processing_queue_dropped_total,
            ai_items_total,
            learning_users_total,
            notifications_sent_total,
            job_runs_total,
            job_ticks_skipped_total,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Text exposition format for `/metrics`.
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_in_text_format() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.sync_runs_total.inc();
        metrics
            .accounts_synced_total
            .with_label_values(&["succeeded"])
            .inc_by(3);
        metrics.processing_queue_depth.set(2);

        let text = metrics.gather().unwrap();
        assert!(text.contains("mailflow_sync_runs_total 1"));
        assert!(text.contains("mailflow_accounts_synced_total{status=\"succeeded\"} 3"));
        assert!(text.contains("mailflow_processing_queue_depth 2"));
    }

    #[test]
    fn test_independent_registries() {
        // Each container owns its registry, so two instances never collide.
        assert!(SyncMetrics::new().is_ok());
        assert!(SyncMetrics::new().is_ok());
    }
}
