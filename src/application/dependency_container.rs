use crate::{
    ai::{AiLayer, HttpAiClient},
    jobs::JobServices,
    learning::LearningScheduler,
    monitoring::{HealthChecker, SyncMetrics},
    notifications::{LogNotificationSink, MilestoneGate, NotificationSink, WebhookNotificationSink},
    processing::{
        process_pending, spawn_worker, BatchProcessor, BatchResult, LearningSignals,
        ProcessingJob, ProcessingQueue,
    },
    providers::{HttpGatewayAdapter, ProviderRegistry},
    storage::{create_pool, MailStore, PgMailStore},
    sync::SyncOrchestrator,
    Config,
};
use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Owns every service object. Scheduled jobs, CLI commands and HTTP
/// triggers all go through the same instances, so per-account guards and
/// learning signals are shared process-wide.
pub struct DependencyContainer {
    // Core configuration
    pub config: Config,

    // Database layer
    pub db_pool: Option<PgPool>,
    pub store: Arc<dyn MailStore>,

    // Outbound integrations
    pub ai: Arc<dyn AiLayer>,
    pub notification_sink: Arc<dyn NotificationSink>,

    // Service layer
    pub orchestrator: Arc<SyncOrchestrator>,
    pub batch_processor: Arc<BatchProcessor>,
    pub learning_scheduler: Arc<LearningScheduler>,
    pub milestone_gate: Arc<MilestoneGate>,
    pub learning_signals: LearningSignals,

    // Infrastructure layer
    pub metrics: Arc<SyncMetrics>,
    pub health_checker: Arc<HealthChecker>,
    pub processing_queue: ProcessingQueue,
    queue_receiver: Mutex<Option<mpsc::Receiver<ProcessingJob>>>,
}

impl DependencyContainer {
    /// Builds the production container: Postgres store, HTTP provider
    /// gateway, HTTP AI layer and the configured notification sink.
    pub async fn new(config: Config) -> Result<Self> {
        info!("🔧 Initializing dependency container...");
        info!(database = %config.safe_database_url(), "Connecting to database");

        let db_pool =
            create_pool(&config.database_url, config.operational.max_db_connections).await?;
        let store: Arc<dyn MailStore> = Arc::new(PgMailStore::new(db_pool.clone()));

        let gateway = HttpGatewayAdapter::new(config.providers.clone())
            .map_err(|e| anyhow::anyhow!("Provider gateway configuration error: {e}"))?;
        let providers = ProviderRegistry::with_all(Arc::new(gateway));

        let ai: Arc<dyn AiLayer> = Arc::new(
            HttpAiClient::new(config.ai.clone())
                .map_err(|e| anyhow::anyhow!("AI client configuration error: {e}"))?,
        );
        let sink = Self::create_notification_sink(&config)?;

        let mut container = Self::with_services(config, store, providers, ai, sink)?;
        container.db_pool = Some(db_pool);

        info!("✅ Dependency container initialized successfully");
        Ok(container)
    }

    /// Wires the service graph around caller-supplied integrations. Used by
    /// `new` and by tests running against `InMemoryStore`.
    pub fn with_services(
        config: Config,
        store: Arc<dyn MailStore>,
        providers: ProviderRegistry,
        ai: Arc<dyn AiLayer>,
        notification_sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let metrics = Arc::new(SyncMetrics::new()?);
        let learning_signals = LearningSignals::new();

        let (queue, receiver) = ProcessingQueue::bounded(config.processor.queue_capacity);
        let processing_queue = queue.with_metrics(metrics.clone());

        let orchestrator = Arc::new(
            SyncOrchestrator::new(store.clone(), providers, config.sync.clone())
                .with_queue(processing_queue.clone())
                .with_metrics(metrics.clone()),
        );
        let batch_processor = Arc::new(
            BatchProcessor::new(
                ai.clone(),
                learning_signals.clone(),
                config.processor.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let learning_scheduler = Arc::new(
            LearningScheduler::new(
                store.clone(),
                ai.clone(),
                notification_sink.clone(),
                learning_signals.clone(),
                config.learning.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let milestone_gate = Arc::new(
            MilestoneGate::new(
                store.clone(),
                notification_sink.clone(),
                config.milestones.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let health_checker = Arc::new(
            HealthChecker::new(store.clone())
                .with_ai(ai.clone())
                .with_queue(processing_queue.clone()),
        );

        Ok(Self {
            config,
            db_pool: None,
            store,
            ai,
            notification_sink,
            orchestrator,
            batch_processor,
            learning_scheduler,
            milestone_gate,
            learning_signals,
            metrics,
            health_checker,
            processing_queue,
            queue_receiver: Mutex::new(Some(receiver)),
        })
    }

    fn create_notification_sink(config: &Config) -> Result<Arc<dyn NotificationSink>> {
        match &config.notifications.webhook_url {
            Some(url) => {
                info!("📬 Notifications delivered to webhook");
                Ok(Arc::new(
                    WebhookNotificationSink::new(url, config.notifications.timeout_seconds)
                        .map_err(|e| anyhow::anyhow!("Notification configuration error: {e}"))?,
                ))
            }
            None => {
                info!("📬 No notification webhook configured, notifications are logged only");
                Ok(Arc::new(LogNotificationSink))
            }
        }
    }

    pub fn job_services(&self) -> Arc<JobServices> {
        Arc::new(JobServices {
            orchestrator: self.orchestrator.clone(),
            learning: self.learning_scheduler.clone(),
            milestones: self.milestone_gate.clone(),
        })
    }

    /// Starts the background worker draining the hand-off queue. Returns
    /// `None` if the worker (or a one-shot drain) already took the receiver.
    pub async fn start_processing_worker(
        &self,
        shutdown: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        let receiver = self.queue_receiver.lock().await.take()?;
        info!(
            capacity = self.config.processor.queue_capacity,
            "⚙️  Background AI processing worker started"
        );
        Some(spawn_worker(
            self.processing_queue.clone(),
            receiver,
            self.batch_processor.clone(),
            shutdown,
        ))
    }

    /// Processes whatever is queued right now. One-shot CLI commands call
    /// this so batches handed off during the command are not left behind.
    pub async fn drain_processing_queue(&self) -> Vec<BatchResult> {
        let mut guard = self.queue_receiver.lock().await;
        match guard.as_mut() {
            Some(receiver) => process_pending(receiver, &self.batch_processor).await,
            None => {
                warn!("Processing queue is owned by the background worker");
                Vec::new()
            }
        }
    }

    pub async fn health_check(&self) -> Result<bool> {
        match self.store.health_check().await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Store health check failed: {}", e);
                Ok(false)
            }
        }
    }
}
