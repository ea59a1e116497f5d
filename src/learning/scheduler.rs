//! Learning Scheduler
//!
//! Decides per user whether enough fresh mail has accumulated to justify an
//! incremental learning pass, runs it, and measures the effect on the
//! user's pattern table. Safe to run more often than weekly: the recency
//! and volume rules turn extra runs into skips.
//!
//! # Rules
//! - fewer than `min_days_between_runs` days since the last completed run: skip
//! - learning window starts at `max(last run, now - max_window_days)`
//! - fewer than `min_new_messages` messages first seen in the window: skip
//! - `created = after - before`, `updated = patterns_found - created`;
//!   a negative value is a data integrity anomaly for that user

use crate::ai::{AiError, AiLayer, LearningResult, LearningWindow};
use crate::mail::{
    LearningRun, LearningRunStatus, NotificationKind, NotificationRecord, Result, SyncError,
    UserSummary,
};
use crate::monitoring::SyncMetrics;
use crate::notifications::{NotificationSink, WeeklyMetrics};
use crate::processing::LearningSignals;
use crate::storage::MailStore;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Days reported for a user who has never completed a learning run.
pub const NEVER_LEARNED_DAYS: i64 = 9999;

pub const WEEKLY_UPDATE: &str = "weekly_update";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    pub min_days_between_runs: i64,
    pub max_window_days: i64,
    pub min_new_messages: i64,
    /// Weekly updates go out when patterns were created or more than this
    /// many were updated.
    pub notify_min_patterns_updated: i64,
    pub max_concurrent_users: usize,
    pub learning_timeout_seconds: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_days_between_runs: 5,
            max_window_days: 7,
            min_new_messages: 10,
            notify_min_patterns_updated: 5,
            max_concurrent_users: 2,
            learning_timeout_seconds: 1800,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserLearningStatus {
    Processed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLearningOutcome {
    pub user_id: Uuid,
    pub status: UserLearningStatus,
    pub days_since_last_learning: i64,
    pub new_messages: i64,
    pub patterns_created: i64,
    pub patterns_updated: i64,
    pub quality_score: Option<f64>,
    pub notification_sent: bool,
    /// The batch processor flagged fresh signal for this user.
    pub signalled: bool,
    pub reason: Option<String>,
}

impl UserLearningOutcome {
    fn new(user_id: Uuid, signalled: bool) -> Self {
        Self {
            user_id,
            status: UserLearningStatus::Processed,
            days_since_last_learning: NEVER_LEARNED_DAYS,
            new_messages: 0,
            patterns_created: 0,
            patterns_updated: 0,
            quality_score: None,
            notification_sent: false,
            signalled,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub users_considered: usize,
    pub users_processed: usize,
    pub users_skipped: usize,
    pub users_failed: usize,
    pub total_patterns_created: i64,
    pub total_patterns_updated: i64,
    pub notifications_sent: usize,
    pub success: bool,
    pub users: Vec<UserLearningOutcome>,
}

impl LearningReport {
    fn from_outcomes(started_at: DateTime<Utc>, users: Vec<UserLearningOutcome>) -> Self {
        let count = |status| users.iter().filter(|u| u.status == status).count();
        let users_failed = count(UserLearningStatus::Failed);
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            completed_at: Utc::now(),
            users_considered: users.len(),
            users_processed: count(UserLearningStatus::Processed),
            users_skipped: count(UserLearningStatus::Skipped),
            users_failed,
            total_patterns_created: users.iter().map(|u| u.patterns_created).sum(),
            total_patterns_updated: users.iter().map(|u| u.patterns_updated).sum(),
            notifications_sent: users.iter().filter(|u| u.notification_sent).count(),
            success: users_failed == 0,
            users,
        }
    }

    pub fn outcome_for(&self, user_id: Uuid) -> Option<&UserLearningOutcome> {
        self.users.iter().find(|u| u.user_id == user_id)
    }
}

/// Whole days since `last`, or the sentinel when there is no prior run.
pub fn days_since(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    last.map(|at| (now - at).num_days())
        .unwrap_or(NEVER_LEARNED_DAYS)
}

/// Week counter reported in weekly updates. A first-ever run is week 1.
pub fn week_number(days_since_last_learning: i64) -> i64 {
    if days_since_last_learning >= NEVER_LEARNED_DAYS {
        return 1;
    }
    days_since_last_learning.max(0) / 7 + 1
}

/// Dedup value for a weekly update: the completion time (ms) of the run the
/// pass started from, or 0 for a first-ever pass. Overlapping passes share a
/// baseline and collapse to one update; consecutive passes never do.
pub fn weekly_update_key(previous_run: Option<DateTime<Utc>>) -> i64 {
    previous_run.map_or(0, |at| at.timestamp_millis())
}

/// Splits a learning pass's touched-pattern count into created and updated.
pub fn pattern_delta(before: i64, after: i64, patterns_found: i64) -> Result<(i64, i64)> {
    let created = after - before;
    if created < 0 {
        return Err(SyncError::anomaly(format!(
            "pattern count shrank during learning ({before} -> {after})"
        )));
    }
    let updated = patterns_found - created;
    if updated < 0 {
        return Err(SyncError::anomaly(format!(
            "learning reported {patterns_found} patterns but {created} were created"
        )));
    }
    Ok((created, updated))
}

pub struct LearningScheduler {
    store: Arc<dyn MailStore>,
    ai: Arc<dyn AiLayer>,
    sink: Arc<dyn NotificationSink>,
    signals: LearningSignals,
    config: LearningConfig,
    metrics: Option<Arc<SyncMetrics>>,
}

impl LearningScheduler {
    pub fn new(
        store: Arc<dyn MailStore>,
        ai: Arc<dyn AiLayer>,
        sink: Arc<dyn NotificationSink>,
        signals: LearningSignals,
        config: LearningConfig,
    ) -> Self {
        Self {
            store,
            ai,
            sink,
            signals,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[instrument(skip(self))]
    pub async fn run_weekly_learning(&self) -> Result<LearningReport> {
        let started_at = Utc::now();
        let users = self.store.list_users().await?;
        let signalled = self.signals.drain().await;

        info!(
            users = users.len(),
            signalled = signalled.len(),
            "🧠 Starting learning run"
        );

        let report = self.run_for_users(users, &signalled, started_at).await;
        info!(
            processed = report.users_processed,
            skipped = report.users_skipped,
            failed = report.users_failed,
            patterns_created = report.total_patterns_created,
            patterns_updated = report.total_patterns_updated,
            "Learning run completed"
        );
        Ok(report)
    }

    /// Manual trigger for one user. The skip rules still apply.
    #[instrument(skip(self))]
    pub async fn run_learning_for_user(&self, user_id: Uuid) -> Result<LearningReport> {
        let started_at = Utc::now();
        let user = self
            .store
            .list_users()
            .await?
            .into_iter()
            .find(|u| u.user_id == user_id)
            .ok_or_else(|| SyncError::NotFound {
                what: format!("user {user_id} with an active account"),
            })?;

        let signalled = if self.signals.contains(user_id).await {
            HashSet::from([user_id])
        } else {
            HashSet::new()
        };
        Ok(self.run_for_users(vec![user], &signalled, started_at).await)
    }

    async fn run_for_users(
        &self,
        users: Vec<UserSummary>,
        signalled: &HashSet<Uuid>,
        started_at: DateTime<Utc>,
    ) -> LearningReport {
        let semaphore = Semaphore::new(self.config.max_concurrent_users.max(1));

        let outcomes = join_all(users.iter().map(|user| {
            let semaphore = &semaphore;
            let was_signalled = signalled.contains(&user.user_id);
            async move {
                let mut outcome = UserLearningOutcome::new(user.user_id, was_signalled);
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        outcome.status = UserLearningStatus::Failed;
                        outcome.reason = Some(e.to_string());
                        return outcome;
                    }
                };

                if let Err(e) = self.learn_for_user(user, &mut outcome).await {
                    if e.is_failure() {
                        error!(user_id = %user.user_id, "Learning failed: {}", e);
                        outcome.status = UserLearningStatus::Failed;
                    } else {
                        debug!(user_id = %user.user_id, "Learning skipped: {}", e);
                        outcome.status = UserLearningStatus::Skipped;
                    }
                    outcome.reason = Some(e.to_string());
                }
                outcome
            }
        }))
        .await;

        let report = LearningReport::from_outcomes(started_at, outcomes);
        if let Some(metrics) = &self.metrics {
            for (status, count) in [
                ("processed", report.users_processed),
                ("skipped", report.users_skipped),
                ("failed", report.users_failed),
            ] {
                metrics
                    .learning_users_total
                    .with_label_values(&[status])
                    .inc_by(count as u64);
            }
        }
        report
    }

    async fn learn_for_user(
        &self,
        user: &UserSummary,
        outcome: &mut UserLearningOutcome,
    ) -> Result<()> {
        let now = Utc::now();
        let last_run = self.store.last_completed_learning_run(user.user_id).await?;
        let last_completed = last_run.map(|r| r.completed_at);

        let days = days_since(last_completed, now);
        outcome.days_since_last_learning = days;
        if days < self.config.min_days_between_runs {
            return Err(SyncError::skipped(format!(
                "last learning run was {days} days ago"
            )));
        }

        let floor = now - Duration::days(self.config.max_window_days);
        let since = last_completed.map_or(floor, |at| at.max(floor));
        let new_messages = self
            .store
            .count_messages_for_user_since(user.user_id, since)
            .await?;
        outcome.new_messages = new_messages;
        if new_messages < self.config.min_new_messages {
            return Err(SyncError::skipped(format!(
                "only {new_messages} new messages since {since}"
            )));
        }

        let window = LearningWindow {
            since,
            until: now,
            new_messages,
        };

        let before = self.store.count_patterns(user.user_id).await?;
        let result = match self.invoke_learning(user, &window).await {
            Ok(result) => result,
            Err(e) => {
                self.record_run(user.user_id, now, new_messages, LearningRunStatus::Failed, 0, 0, None)
                    .await?;
                return Err(e.into());
            }
        };
        let after = self.store.count_patterns(user.user_id).await?;

        let (created, updated) = match pattern_delta(before, after, result.patterns_found) {
            Ok(delta) => delta,
            Err(e) => {
                error!(
                    user_id = %user.user_id,
                    before,
                    after,
                    patterns_found = result.patterns_found,
                    "Inconsistent pattern counts after learning"
                );
                self.record_run(
                    user.user_id,
                    now,
                    new_messages,
                    LearningRunStatus::Failed,
                    after - before,
                    result.patterns_found - (after - before),
                    result.quality_score,
                )
                .await?;
                return Err(e);
            }
        };

        self.record_run(
            user.user_id,
            now,
            new_messages,
            LearningRunStatus::Completed,
            created,
            updated,
            result.quality_score,
        )
        .await?;

        outcome.patterns_created = created;
        outcome.patterns_updated = updated;
        outcome.quality_score = result.quality_score;

        info!(
            user_id = %user.user_id,
            new_messages,
            created,
            updated,
            "Learning pass completed"
        );

        if created > 0 || updated > self.config.notify_min_patterns_updated {
            if let Some(organization_id) = user.organization_id {
                let metrics = WeeklyMetrics {
                    week_number: week_number(days),
                    messages_analyzed: new_messages,
                    patterns_created: created,
                    patterns_updated: updated,
                    quality_score: result.quality_score,
                };
                outcome.notification_sent = self
                    .send_weekly_update(user.user_id, organization_id, last_completed, &metrics)
                    .await?;
            }
        }

        Ok(())
    }

    async fn invoke_learning(
        &self,
        user: &UserSummary,
        window: &LearningWindow,
    ) -> std::result::Result<LearningResult, AiError> {
        let timeout = std::time::Duration::from_secs(self.config.learning_timeout_seconds);
        let account_hint = user.account_ids.first().copied();
        tokio::time::timeout(
            timeout,
            self.ai
                .run_incremental_learning(user.user_id, window, account_hint),
        )
        .await
        .map_err(|_| AiError::Timeout(self.config.learning_timeout_seconds))?
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_run(
        &self,
        user_id: Uuid,
        started_at: DateTime<Utc>,
        messages_considered: i64,
        status: LearningRunStatus,
        patterns_created: i64,
        patterns_updated: i64,
        quality_score: Option<f64>,
    ) -> Result<()> {
        let run = LearningRun {
            id: Uuid::new_v4(),
            user_id,
            started_at,
            completed_at: Utc::now(),
            status,
            messages_considered,
            patterns_created,
            patterns_updated,
            quality_score,
        };
        self.store.record_learning_run(&run).await
    }

    /// Claims the update for the learning cycle that started at
    /// `previous_run`, then sends it. Returns whether this call sent it.
    async fn send_weekly_update(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        previous_run: Option<DateTime<Utc>>,
        metrics: &WeeklyMetrics,
    ) -> Result<bool> {
        let cycle_key = weekly_update_key(previous_run);
        let record =
            NotificationRecord::new(user_id, NotificationKind::WeeklyUpdate, WEEKLY_UPDATE, cycle_key);

        if !self.store.insert_notification_if_absent(&record).await? {
            debug!(%user_id, cycle_key, "Weekly update already sent for this learning cycle");
            return Ok(false);
        }

        if let Err(e) = self
            .sink
            .send_weekly_update(user_id, organization_id, metrics)
            .await
        {
            warn!(%user_id, "Weekly update delivery failed: {}", e);
        }
        if let Some(m) = &self.metrics {
            m.notifications_sent_total
                .with_label_values(&["weekly_update"])
                .inc();
        }
        Ok(true)
    }
}
