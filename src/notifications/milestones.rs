//! Volume milestones, announced once per (user, type, threshold).
//!
//! Thresholds are walked in ascending order. The first reached threshold
//! without a record is claimed through the store's atomic insert-if-absent
//! and then sent. By default only one milestone is announced per check, so
//! a user who jumps past several thresholds hears about them over
//! successive runs.

use super::{Milestone, NotificationSink};
use crate::mail::{NotificationKind, NotificationRecord, Result};
use crate::monitoring::SyncMetrics;
use crate::storage::MailStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const EMAILS_PROCESSED: &str = "emails_processed";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneConfig {
    pub thresholds: Vec<i64>,
    /// Announce every newly reached threshold in one check instead of the
    /// lowest one only.
    pub announce_all_reached: bool,
}

impl Default for MilestoneConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![100, 1000, 5000, 10000],
            announce_all_reached: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneOutcome {
    pub user_id: Uuid,
    pub total_messages: i64,
    pub announced: Vec<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneReport {
    pub run_id: Uuid,
    pub users_checked: usize,
    pub users_failed: usize,
    pub milestones_announced: usize,
    pub success: bool,
    pub users: Vec<MilestoneOutcome>,
}

pub struct MilestoneGate {
    store: Arc<dyn MailStore>,
    sink: Arc<dyn NotificationSink>,
    config: MilestoneConfig,
    metrics: Option<Arc<SyncMetrics>>,
}

impl MilestoneGate {
    pub fn new(
        store: Arc<dyn MailStore>,
        sink: Arc<dyn NotificationSink>,
        mut config: MilestoneConfig,
    ) -> Self {
        config.thresholds.sort_unstable();
        config.thresholds.dedup();
        Self {
            store,
            sink,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[instrument(skip(self))]
    pub async fn check_milestones(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> Result<MilestoneOutcome> {
        let total = self.store.count_messages_for_user(user_id).await?;
        let mut announced = Vec::new();

        for &threshold in self.config.thresholds.iter().take_while(|&&t| total >= t) {
            if self
                .store
                .notification_exists(user_id, NotificationKind::Milestone, EMAILS_PROCESSED, threshold)
                .await?
            {
                continue;
            }

            let record = NotificationRecord::new(
                user_id,
                NotificationKind::Milestone,
                EMAILS_PROCESSED,
                threshold,
            );
            // Another run may have claimed it between the check and here.
            if !self.store.insert_notification_if_absent(&record).await? {
                continue;
            }

            let milestone = Milestone {
                milestone_type: EMAILS_PROCESSED.to_string(),
                value: threshold,
            };
            if let Err(e) = self
                .sink
                .send_milestone(user_id, organization_id, &milestone)
                .await
            {
                warn!(threshold, "Milestone delivery failed: {}", e);
            }

            info!(threshold, total, "Milestone announced");
            if let Some(metrics) = &self.metrics {
                metrics
                    .notifications_sent_total
                    .with_label_values(&["milestone"])
                    .inc();
            }
            announced.push(threshold);

            if !self.config.announce_all_reached {
                break;
            }
        }

        Ok(MilestoneOutcome {
            user_id,
            total_messages: total,
            announced,
            error: None,
        })
    }

    pub async fn check_all_users(&self) -> Result<MilestoneReport> {
        let users = self.store.list_users().await?;
        let mut outcomes = Vec::with_capacity(users.len());

        for user in users {
            match self.check_milestones(user.user_id, user.organization_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(user_id = %user.user_id, "Milestone check failed: {}", e);
                    outcomes.push(MilestoneOutcome {
                        user_id: user.user_id,
                        total_messages: 0,
                        announced: Vec::new(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let users_failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        Ok(MilestoneReport {
            run_id: Uuid::new_v4(),
            users_checked: outcomes.len(),
            users_failed,
            milestones_announced: outcomes.iter().map(|o| o.announced.len()).sum(),
            success: users_failed == 0,
            users: outcomes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{Account, IncomingMessage, NewIndexedMessage, ProviderKind};
    use crate::notifications::RecordingNotificationSink;
    use crate::storage::InMemoryStore;
    use chrono::Utc;

    async fn user_with_messages(store: &InMemoryStore, count: usize) -> Uuid {
        let account = Account::new(Uuid::new_v4(), "m@example.com", ProviderKind::Google);
        store.upsert_account(&account).await.unwrap();
        let rows: Vec<_> = (0..count)
            .map(|i| {
                NewIndexedMessage::from_incoming(
                    account.id,
                    IncomingMessage::new(format!("<{i}>"), Utc::now()),
                    Utc::now(),
                )
            })
            .collect();
        store.insert_messages(&rows).await.unwrap();
        account.user_id
    }

    #[tokio::test]
    async fn test_only_lowest_unannounced_threshold_per_run() {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingNotificationSink::new());
        let user = user_with_messages(&store, 1200).await;
        let gate = MilestoneGate::new(store.clone(), sink.clone(), MilestoneConfig::default());

        assert_eq!(gate.check_milestones(user, None).await.unwrap().announced, vec![100]);
        assert_eq!(gate.check_milestones(user, None).await.unwrap().announced, vec![1000]);
        assert!(gate.check_milestones(user, None).await.unwrap().announced.is_empty());
        assert_eq!(sink.milestones_for(user).await, vec![100, 1000]);
    }

    #[tokio::test]
    async fn test_announce_all_reached() {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingNotificationSink::new());
        let user = user_with_messages(&store, 1200).await;
        let config = MilestoneConfig {
            announce_all_reached: true,
            ..MilestoneConfig::default()
        };
        let gate = MilestoneGate::new(store, sink, config);

        let outcome = gate.check_milestones(user, None).await.unwrap();
        assert_eq!(outcome.announced, vec![100, 1000]);
    }

    #[tokio::test]
    async fn test_delivery_failure_still_records_claim() {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingNotificationSink::failing());
        let user = user_with_messages(&store, 150).await;
        let gate = MilestoneGate::new(store.clone(), sink, MilestoneConfig::default());

        gate.check_milestones(user, None).await.unwrap();
        assert_eq!(store.notifications(user).await.len(), 1);
        assert!(gate.check_milestones(user, None).await.unwrap().announced.is_empty());
    }
}
