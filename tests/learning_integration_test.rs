//! Learning scheduler and milestone gate behaviour over the in-memory store.

mod test_helpers;

use chrono::Utc;
use mailflow_core::ai::MockAiLayer;
use mailflow_core::learning::{LearningConfig, LearningScheduler, UserLearningStatus};
use mailflow_core::mail::{LearningRun, LearningRunStatus, NotificationKind, NotificationRecord};
use mailflow_core::notifications::{
    MilestoneConfig, MilestoneGate, RecordingNotificationSink, SentNotification,
};
use mailflow_core::processing::LearningSignals;
use mailflow_core::storage::{InMemoryStore, MailStore};
use std::sync::Arc;
use test_helpers::{days_ago, seed_account, seed_indexed};
use tracing_test::traced_test;
use uuid::Uuid;

fn completed_run(user_id: Uuid, days: i64) -> LearningRun {
    LearningRun {
        id: Uuid::new_v4(),
        user_id,
        started_at: days_ago(days),
        completed_at: days_ago(days),
        status: LearningRunStatus::Completed,
        messages_considered: 100,
        patterns_created: 1,
        patterns_updated: 0,
        quality_score: None,
    }
}

fn scheduler(
    store: Arc<InMemoryStore>,
    ai: Arc<MockAiLayer>,
    sink: Arc<RecordingNotificationSink>,
) -> LearningScheduler {
    LearningScheduler::new(store, ai, sink, LearningSignals::new(), LearningConfig::default())
}

#[tokio::test]
async fn test_recent_learning_is_skipped_regardless_of_volume() {
    let store = Arc::new(InMemoryStore::new());
    let ai = Arc::new(MockAiLayer::new());
    let account = seed_account(&store, None).await;
    store
        .record_learning_run(&completed_run(account.user_id, 3))
        .await
        .unwrap();
    seed_indexed(&store, account.id, "busy", 1000, Utc::now()).await;

    let report = scheduler(store.clone(), ai.clone(), Arc::new(RecordingNotificationSink::new()))
        .run_weekly_learning()
        .await
        .unwrap();

    let outcome = report.outcome_for(account.user_id).unwrap();
    assert_eq!(outcome.status, UserLearningStatus::Skipped);
    assert_eq!(outcome.days_since_last_learning, 3);
    assert!(ai.learning_calls().await.is_empty());
    assert_eq!(store.learning_runs(account.user_id).await.len(), 1);
    assert!(report.success);
}

#[tokio::test]
async fn test_low_volume_user_is_skipped_without_a_run() {
    let store = Arc::new(InMemoryStore::new());
    let ai = Arc::new(MockAiLayer::new());
    let account = seed_account(&store, None).await;
    store
        .record_learning_run(&completed_run(account.user_id, 10))
        .await
        .unwrap();
    seed_indexed(&store, account.id, "quiet", 3, Utc::now()).await;

    let report = scheduler(store.clone(), ai.clone(), Arc::new(RecordingNotificationSink::new()))
        .run_weekly_learning()
        .await
        .unwrap();

    let outcome = report.outcome_for(account.user_id).unwrap();
    assert_eq!(outcome.status, UserLearningStatus::Skipped);
    assert_eq!(outcome.new_messages, 3);
    assert!(ai.learning_calls().await.is_empty());
    assert_eq!(store.learning_runs(account.user_id).await.len(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_eligible_user_learns_and_gets_weekly_update() {
    let store = Arc::new(InMemoryStore::new());
    let org = Uuid::new_v4();
    let account = seed_account(&store, Some(org)).await;
    seed_indexed(&store, account.id, "learn", 40, Utc::now()).await;
    store.insert_pattern(account.user_id, "existing").await;

    let ai = Arc::new(
        MockAiLayer::new()
            .creating_patterns(store.clone(), 2)
            .with_learning_result(9, Some(0.91)),
    );
    let sink = Arc::new(RecordingNotificationSink::new());
    let report = scheduler(store.clone(), ai.clone(), sink.clone())
        .run_weekly_learning()
        .await
        .unwrap();

    let outcome = report.outcome_for(account.user_id).unwrap();
    assert_eq!(outcome.status, UserLearningStatus::Processed);
    assert_eq!(outcome.patterns_created, 2);
    assert_eq!(outcome.patterns_updated, 7);
    assert!(outcome.notification_sent);

    let calls = ai.learning_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].window.new_messages, 40);
    assert!(calls[0].window.until - calls[0].window.since <= chrono::Duration::days(7));

    let runs = store.learning_runs(account.user_id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, LearningRunStatus::Completed);

    let sent = sink.sent().await;
    assert!(matches!(
        &sent[..],
        [SentNotification::WeeklyUpdate { organization_id, metrics, .. }]
            if *organization_id == org && metrics.week_number == 1 && metrics.patterns_created == 2
    ));
}

#[tokio::test]
async fn test_second_pass_in_same_week_still_sends_update() {
    let store = Arc::new(InMemoryStore::new());
    let org = Uuid::new_v4();
    let account = seed_account(&store, Some(org)).await;
    store
        .record_learning_run(&completed_run(account.user_id, 12))
        .await
        .unwrap();
    seed_indexed(&store, account.id, "monday", 20, Utc::now()).await;

    let ai = Arc::new(
        MockAiLayer::new()
            .creating_patterns(store.clone(), 1)
            .with_learning_result(8, None),
    );
    let sink = Arc::new(RecordingNotificationSink::new());
    let config = LearningConfig {
        min_days_between_runs: 0,
        ..LearningConfig::default()
    };
    let scheduler = LearningScheduler::new(
        store.clone(),
        ai.clone(),
        sink.clone(),
        LearningSignals::new(),
        config,
    );

    let first = scheduler.run_weekly_learning().await.unwrap();
    assert!(first.outcome_for(account.user_id).unwrap().notification_sent);

    seed_indexed(&store, account.id, "saturday", 15, Utc::now()).await;
    let second = scheduler.run_weekly_learning().await.unwrap();
    let outcome = second.outcome_for(account.user_id).unwrap();
    assert_eq!(outcome.status, UserLearningStatus::Processed);
    assert!(outcome.notification_sent);

    let updates = sink
        .sent()
        .await
        .into_iter()
        .filter(|n| matches!(n, SentNotification::WeeklyUpdate { .. }))
        .count();
    assert_eq!(updates, 2);
}

#[tokio::test]
async fn test_negative_pattern_delta_fails_the_user() {
    let store = Arc::new(InMemoryStore::new());
    let account = seed_account(&store, None).await;
    seed_indexed(&store, account.id, "anomaly", 20, Utc::now()).await;

    // Three patterns appear while the layer reports only one.
    let ai = Arc::new(
        MockAiLayer::new()
            .creating_patterns(store.clone(), 3)
            .with_learning_result(1, None),
    );
    let report = scheduler(store.clone(), ai, Arc::new(RecordingNotificationSink::new()))
        .run_weekly_learning()
        .await
        .unwrap();

    let outcome = report.outcome_for(account.user_id).unwrap();
    assert_eq!(outcome.status, UserLearningStatus::Failed);
    assert!(!report.success);
    let runs = store.learning_runs(account.user_id).await;
    assert_eq!(runs[0].status, LearningRunStatus::Failed);
}

#[tokio::test]
async fn test_ai_failure_is_isolated_per_user() {
    let store = Arc::new(InMemoryStore::new());
    let first = seed_account(&store, None).await;
    let second = seed_account(&store, None).await;
    seed_indexed(&store, first.id, "f", 15, Utc::now()).await;
    seed_indexed(&store, second.id, "s", 15, Utc::now()).await;

    let report = scheduler(
        store.clone(),
        Arc::new(MockAiLayer::new().with_failing_learning()),
        Arc::new(RecordingNotificationSink::new()),
    )
    .run_weekly_learning()
    .await
    .unwrap();

    assert_eq!(report.users_failed, 2);
    assert_eq!(report.users_considered, 2);
    assert!(store
        .last_completed_learning_run(first.user_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_milestone_announced_once_per_threshold() {
    let store = Arc::new(InMemoryStore::new());
    let account = seed_account(&store, None).await;
    seed_indexed(&store, account.id, "ms", 1200, Utc::now()).await;
    for value in [100, 1000] {
        store
            .insert_notification_if_absent(&NotificationRecord::new(
                account.user_id,
                NotificationKind::Milestone,
                "emails_processed",
                value,
            ))
            .await
            .unwrap();
    }

    let sink = Arc::new(RecordingNotificationSink::new());
    let gate = MilestoneGate::new(store.clone(), sink.clone(), MilestoneConfig::default());

    let report = gate.check_all_users().await.unwrap();
    assert_eq!(report.milestones_announced, 0);
    assert!(sink.sent().await.is_empty());

    seed_indexed(&store, account.id, "ms-more", 3900, Utc::now()).await;
    let outcome = gate.check_milestones(account.user_id, None).await.unwrap();
    assert_eq!(outcome.announced, vec![5000]);
    assert_eq!(sink.milestones_for(account.user_id).await, vec![5000]);

    assert!(gate
        .check_milestones(account.user_id, None)
        .await
        .unwrap()
        .announced
        .is_empty());
}

#[tokio::test]
async fn test_concurrent_milestone_checks_send_once() {
    let store = Arc::new(InMemoryStore::new());
    let account = seed_account(&store, None).await;
    seed_indexed(&store, account.id, "race", 150, Utc::now()).await;
    let sink = Arc::new(RecordingNotificationSink::new());
    let gate = Arc::new(MilestoneGate::new(
        store.clone(),
        sink.clone(),
        MilestoneConfig::default(),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let gate = gate.clone();
            let user = account.user_id;
            tokio::spawn(async move { gate.check_milestones(user, None).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(sink.milestones_for(account.user_id).await, vec![100]);
    assert_eq!(store.notifications(account.user_id).await.len(), 1);
}
