use crate::ai::AiLayer;
use crate::processing::ProcessingQueue;
use crate::storage::MailStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_checked: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub components: HashMap<String, ComponentHealth>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub max_response_time_ms: u64,
    /// Queue fill ratio above which the processing queue reports degraded.
    pub max_queue_utilization: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_response_time_ms: 1000,
            max_queue_utilization: 0.8,
        }
    }
}

/// Checks the store, the AI layer and the processing queue. The store is
/// the only component whose failure makes the whole system unhealthy.
#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn MailStore>,
    ai: Option<Arc<dyn AiLayer>>,
    queue: Option<ProcessingQueue>,
    start_time: SystemTime,
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn MailStore>) -> Self {
        Self {
            store,
            ai: None,
            queue: None,
            start_time: SystemTime::now(),
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiLayer>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_queue(mut self, queue: ProcessingQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn check_system_health(&self) -> SystemHealth {
        let mut components = HashMap::new();
        components.insert("database".to_string(), self.check_database().await);
        if let Some(ai) = &self.ai {
            components.insert("ai_layer".to_string(), Self::check_ai(ai.as_ref()).await);
        }
        if let Some(queue) = &self.queue {
            components.insert("processing_queue".to_string(), self.check_queue(queue));
        }

        let status = Self::overall_status(&components);
        debug!(?status, "System health check completed");

        SystemHealth {
            status,
            timestamp: Utc::now(),
            components,
            uptime_seconds: self
                .start_time
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let start = Instant::now();
        let (mut status, mut message) = match self.store.health_check().await {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!("Database health check failed: {}", e);
                (
                    HealthStatus::Unhealthy,
                    Some(format!("Database connection failed: {e}")),
                )
            }
        };

        let response_time = start.elapsed().as_millis() as u64;
        if status == HealthStatus::Healthy && response_time > self.thresholds.max_response_time_ms
        {
            warn!("Database response time degraded: {}ms", response_time);
            status = HealthStatus::Degraded;
            message = Some(format!("Slow database response: {response_time}ms"));
        }

        ComponentHealth {
            status,
            message,
            last_checked: Utc::now(),
            response_time_ms: Some(response_time),
        }
    }

    async fn check_ai(ai: &dyn AiLayer) -> ComponentHealth {
        let start = Instant::now();
        let (status, message) = match ai.health_check().await {
            Ok(true) => (HealthStatus::Healthy, None),
            Ok(false) => (
                HealthStatus::Degraded,
                Some("AI layer reported not ready".to_string()),
            ),
            Err(e) => {
                warn!("AI layer health check failed: {}", e);
                (HealthStatus::Degraded, Some(e.to_string()))
            }
        };
        ComponentHealth {
            status,
            message,
            last_checked: Utc::now(),
            response_time_ms: Some(start.elapsed().as_millis() as u64),
        }
    }

    fn check_queue(&self, queue: &ProcessingQueue) -> ComponentHealth {
        let snapshot = queue.snapshot();
        let utilization = snapshot.depth as f64 / snapshot.capacity as f64;
        let (status, message) = if utilization > self.thresholds.max_queue_utilization {
            (
                HealthStatus::Degraded,
                Some(format!(
                    "Processing queue at {:.0}% ({} dropped so far)",
                    utilization * 100.0,
                    snapshot.dropped
                )),
            )
        } else {
            (HealthStatus::Healthy, None)
        };
        ComponentHealth {
            status,
            message,
            last_checked: Utc::now(),
            response_time_ms: None,
        }
    }

    fn overall_status(components: &HashMap<String, ComponentHealth>) -> HealthStatus {
        if components
            .get("database")
            .is_some_and(|c| c.status == HealthStatus::Unhealthy)
        {
            return HealthStatus::Unhealthy;
        }
        if components
            .values()
            .any(|c| c.status != HealthStatus::Healthy)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockAiLayer;
    use crate::storage::InMemoryStore;

    #[tokio::test]
    async fn test_healthy_with_in_memory_store() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, _rx) = ProcessingQueue::bounded(4);
        let checker = HealthChecker::new(store)
            .with_ai(Arc::new(MockAiLayer::new()))
            .with_queue(queue);

        let health = checker.check_system_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.components.len(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_degrades() {
        use crate::processing::ProcessingJob;
        use uuid::Uuid;

        let store = Arc::new(InMemoryStore::new());
        let (queue, _rx) = ProcessingQueue::bounded(1);
        queue.try_enqueue(ProcessingJob {
            user_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            messages: Vec::new(),
        });
        let checker = HealthChecker::new(store).with_queue(queue);

        let health = checker.check_system_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
    }
}
