//! Outbound notifications. Delivery is fire-and-forget from the core's point
//! of view: callers log sink failures and move on.

pub mod milestones;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use url::Url;
use uuid::Uuid;

pub use milestones::{MilestoneConfig, MilestoneGate, MilestoneOutcome, MilestoneReport};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone_type: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyMetrics {
    pub week_number: i64,
    pub messages_analyzed: i64,
    pub patterns_created: i64,
    pub patterns_updated: i64,
    pub quality_score: Option<f64>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_milestone(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
        milestone: &Milestone,
    ) -> Result<(), NotificationError>;

    async fn send_weekly_update(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        metrics: &WeeklyMetrics,
    ) -> Result<(), NotificationError>;
}

/// Writes notifications to the log. Default sink when no webhook is set.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send_milestone(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
        milestone: &Milestone,
    ) -> Result<(), NotificationError> {
        info!(
            %user_id,
            organization_id = ?organization_id,
            milestone_type = %milestone.milestone_type,
            value = milestone.value,
            "🎉 Milestone reached"
        );
        Ok(())
    }

    async fn send_weekly_update(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        metrics: &WeeklyMetrics,
    ) -> Result<(), NotificationError> {
        info!(
            %user_id,
            %organization_id,
            week = metrics.week_number,
            patterns_created = metrics.patterns_created,
            patterns_updated = metrics.patterns_updated,
            "📬 Weekly learning update"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WebhookEvent<'a> {
    Milestone {
        user_id: Uuid,
        organization_id: Option<Uuid>,
        milestone: &'a Milestone,
    },
    WeeklyUpdate {
        user_id: Uuid,
        organization_id: Uuid,
        metrics: &'a WeeklyMetrics,
    },
}

/// Posts notification events as JSON to a single webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotificationSink {
    url: Url,
    client: Client,
}

impl WebhookNotificationSink {
    pub fn new(url: &str, timeout_seconds: u64) -> Result<Self, NotificationError> {
        let url = Url::parse(url).map_err(|e| NotificationError::InvalidUrl(e.to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;
        Ok(Self { url, client })
    }

    async fn post(&self, event: &WebhookEvent<'_>) -> Result<(), NotificationError> {
        let response = self.client.post(self.url.clone()).json(event).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::Rejected(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn send_milestone(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
        milestone: &Milestone,
    ) -> Result<(), NotificationError> {
        self.post(&WebhookEvent::Milestone {
            user_id,
            organization_id,
            milestone,
        })
        .await
    }

    async fn send_weekly_update(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        metrics: &WeeklyMetrics,
    ) -> Result<(), NotificationError> {
        self.post(&WebhookEvent::WeeklyUpdate {
            user_id,
            organization_id,
            metrics,
        })
        .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SentNotification {
    Milestone {
        user_id: Uuid,
        milestone: Milestone,
    },
    WeeklyUpdate {
        user_id: Uuid,
        organization_id: Uuid,
        metrics: WeeklyMetrics,
    },
}

/// Keeps every notification in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<SentNotification>>,
    fail: bool,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send is recorded and then reported as failed.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }

    pub async fn milestones_for(&self, user_id: Uuid) -> Vec<i64> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|n| match n {
                SentNotification::Milestone { user_id: u, milestone } if *u == user_id => {
                    Some(milestone.value)
                }
                _ => None,
            })
            .collect()
    }

    fn result(&self) -> Result<(), NotificationError> {
        if self.fail {
            Err(NotificationError::Rejected("recording sink set to fail".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn send_milestone(
        &self,
        user_id: Uuid,
        _organization_id: Option<Uuid>,
        milestone: &Milestone,
    ) -> Result<(), NotificationError> {
        self.sent.lock().await.push(SentNotification::Milestone {
            user_id,
            milestone: milestone.clone(),
        });
        self.result()
    }

    async fn send_weekly_update(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        metrics: &WeeklyMetrics,
    ) -> Result<(), NotificationError> {
        self.sent.lock().await.push(SentNotification::WeeklyUpdate {
            user_id,
            organization_id,
            metrics: metrics.clone(),
        });
        self.result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_rejects_bad_url() {
        assert!(matches!(
            WebhookNotificationSink::new("::not a url::", 5),
            Err(NotificationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_webhook_event_shape() {
        let milestone = Milestone {
            milestone_type: "emails_processed".into(),
            value: 1000,
        };
        let event = WebhookEvent::Milestone {
            user_id: Uuid::nil(),
            organization_id: None,
            milestone: &milestone,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "milestone");
        assert_eq!(json["milestone"]["value"], 1000);
    }

    #[tokio::test]
    async fn test_recording_sink_collects_by_user() {
        let sink = RecordingNotificationSink::new();
        let user = Uuid::new_v4();
        let milestone = Milestone {
            milestone_type: "emails_processed".into(),
            value: 100,
        };
        sink.send_milestone(user, None, &milestone).await.unwrap();
        sink.send_milestone(Uuid::new_v4(), None, &milestone).await.unwrap();
        assert_eq!(sink.milestones_for(user).await, vec![100]);
    }
}
