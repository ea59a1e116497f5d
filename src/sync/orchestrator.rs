//! Sync Orchestrator
//!
//! Drives each account through fetch → dedup → persist → cursor advance,
//! strictly in that order. Accounts run in parallel up to
//! `max_concurrent_accounts`; one account's failure is recorded in the
//! report and never aborts its siblings. Provider errors are not retried
//! in-loop: the next scheduled run picks the account up again.

use super::dedup::DedupEngine;
use super::locks::AccountLocks;
use super::state::{AttemptOutcome, SyncStateTracker};
use super::SyncConfig;
use crate::mail::{Account, IncomingMessage, NewIndexedMessage, Result, SyncError};
use crate::monitoring::SyncMetrics;
use crate::processing::{EnqueueOutcome, ProcessingJob, ProcessingQueue};
use crate::providers::{
    FetchMode, FetchWindow, PageCursor, ProviderAdapter, ProviderError, ProviderRegistry,
};
use crate::storage::MailStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSyncStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSyncOutcome {
    pub account_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub status: AccountSyncStatus,
    pub mode: Option<FetchMode>,
    pub pages_fetched: usize,
    pub new_messages: usize,
    pub duplicates: usize,
    pub queued_for_processing: bool,
    /// The per-run cap stopped the fetch; the cursor stays put.
    pub truncated: bool,
    /// Set when the provider rejected the credentials.
    pub auth_required: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AccountSyncOutcome {
    fn new(account: &Account) -> Self {
        Self {
            account_id: account.id,
            user_id: account.user_id,
            email: account.email.clone(),
            status: AccountSyncStatus::Succeeded,
            mode: None,
            pages_fetched: 0,
            new_messages: 0,
            duplicates: 0,
            queued_for_processing: false,
            truncated: false,
            auth_required: false,
            error: None,
            duration_ms: 0,
        }
    }

    fn skipped(account: &Account, reason: impl Into<String>) -> Self {
        Self {
            status: AccountSyncStatus::Skipped,
            error: Some(reason.into()),
            ..Self::new(account)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub accounts_attempted: usize,
    pub accounts_succeeded: usize,
    pub accounts_failed: usize,
    pub accounts_skipped: usize,
    pub total_new_messages: usize,
    pub total_duplicates: usize,
    /// False when any account failed.
    pub success: bool,
    pub accounts: Vec<AccountSyncOutcome>,
}

impl SyncReport {
    fn from_outcomes(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        accounts: Vec<AccountSyncOutcome>,
    ) -> Self {
        let count = |status| accounts.iter().filter(|a| a.status == status).count();
        let accounts_failed = count(AccountSyncStatus::Failed);

        Self {
            run_id,
            started_at,
            completed_at: Utc::now(),
            accounts_attempted: accounts.len(),
            accounts_succeeded: count(AccountSyncStatus::Succeeded),
            accounts_failed,
            accounts_skipped: count(AccountSyncStatus::Skipped),
            total_new_messages: accounts.iter().map(|a| a.new_messages).sum(),
            total_duplicates: accounts.iter().map(|a| a.duplicates).sum(),
            success: accounts_failed == 0,
            accounts,
        }
    }

    pub fn outcome_for(&self, account_id: Uuid) -> Option<&AccountSyncOutcome> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }
}

/// What a successful fetch-dedup-persist pass produced for one account.
struct AccountProgress {
    mode: FetchMode,
    pages_fetched: usize,
    new_messages: Vec<crate::mail::IndexedMessage>,
    duplicates: usize,
    truncated: bool,
}

/// Deduplicated result of paging through one fetch window.
struct FetchedWindow {
    new: Vec<IncomingMessage>,
    duplicates: usize,
    pages: usize,
    truncated: bool,
}

pub struct SyncOrchestrator {
    store: Arc<dyn MailStore>,
    providers: ProviderRegistry,
    dedup: DedupEngine,
    tracker: SyncStateTracker,
    locks: AccountLocks,
    queue: Option<ProcessingQueue>,
    metrics: Option<Arc<SyncMetrics>>,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn MailStore>, providers: ProviderRegistry, config: SyncConfig) -> Self {
        Self {
            dedup: DedupEngine::new(store.clone()),
            tracker: SyncStateTracker::new(&config),
            store,
            providers,
            locks: AccountLocks::new(),
            queue: None,
            metrics: None,
            config,
        }
    }

    pub fn with_queue(mut self, queue: ProcessingQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_locks(mut self, locks: AccountLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &AccountLocks {
        &self.locks
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    #[instrument(skip(self))]
    pub async fn sync_all_active_accounts(&self) -> Result<SyncReport> {
        let accounts = self.store.list_active_accounts().await?;
        info!("🔄 Syncing {} active accounts", accounts.len());
        Ok(self.sync_accounts(accounts, false).await)
    }

    /// Same as a full run, restricted to accounts flagged for real-time sync.
    #[instrument(skip(self))]
    pub async fn sync_realtime_accounts(&self) -> Result<SyncReport> {
        let accounts: Vec<Account> = self
            .store
            .list_active_accounts()
            .await?
            .into_iter()
            .filter(|a| a.real_time_sync)
            .collect();
        debug!("Syncing {} real-time accounts", accounts.len());
        Ok(self.sync_accounts(accounts, false).await)
    }

    /// Manual trigger for one account. `force_full` discards the cursor first.
    #[instrument(skip(self))]
    pub async fn sync_account(&self, account_id: Uuid, force_full: bool) -> Result<SyncReport> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                what: format!("account {account_id}"),
            })?;

        if !account.active {
            let run_id = Uuid::new_v4();
            let outcome = AccountSyncOutcome::skipped(&account, "account is inactive");
            return Ok(SyncReport::from_outcomes(run_id, Utc::now(), vec![outcome]));
        }

        Ok(self.sync_accounts(vec![account], force_full).await)
    }

    async fn sync_accounts(&self, accounts: Vec<Account>, force_full: bool) -> SyncReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = Instant::now();
        let semaphore = Semaphore::new(self.config.max_concurrent_accounts.max(1));

        if let Some(metrics) = &self.metrics {
            metrics.sync_runs_total.inc();
        }

        let outcomes = join_all(accounts.iter().map(|account| {
            let semaphore = &semaphore;
            async move {
                match semaphore.acquire().await {
                    Ok(_permit) => self.sync_one(account, force_full).await,
                    Err(e) => AccountSyncOutcome {
                        status: AccountSyncStatus::Failed,
                        error: Some(format!("worker pool closed: {e}")),
                        ..AccountSyncOutcome::new(account)
                    },
                }
            }
        }))
        .await;

        let report = SyncReport::from_outcomes(run_id, started_at, outcomes);
        self.record_metrics(&report, timer.elapsed());

        info!(
            %run_id,
            attempted = report.accounts_attempted,
            succeeded = report.accounts_succeeded,
            failed = report.accounts_failed,
            skipped = report.accounts_skipped,
            new_messages = report.total_new_messages,
            duplicates = report.total_duplicates,
            "Sync run completed"
        );
        report
    }

    #[instrument(skip(self, account), fields(account_id = %account.id, provider = %account.provider))]
    async fn sync_one(&self, account: &Account, force_full: bool) -> AccountSyncOutcome {
        let timer = Instant::now();

        let Some(_guard) = self.locks.try_acquire(account.id) else {
            info!("Sync already in progress, skipping account");
            let reason = SyncError::AlreadyInProgress {
                account_id: account.id.to_string(),
            };
            return AccountSyncOutcome::skipped(account, reason.to_string());
        };

        // Excludes other processes (a CLI run beside `serve`, other replicas).
        let holder = Uuid::new_v4();
        let lease = chrono::Duration::seconds(self.config.claim_lease_seconds.max(1) as i64);
        match self.store.try_claim_sync(account.id, holder, lease).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Sync claimed by another process, skipping account");
                let reason = SyncError::AlreadyInProgress {
                    account_id: account.id.to_string(),
                };
                return AccountSyncOutcome::skipped(account, reason.to_string());
            }
            Err(e) => {
                error!("Failed to claim account for sync: {}", e);
                return AccountSyncOutcome {
                    status: AccountSyncStatus::Failed,
                    error: Some(e.to_string()),
                    ..AccountSyncOutcome::new(account)
                };
            }
        }

        let mut outcome = self.sync_claimed(account, force_full).await;

        if let Err(e) = self.store.release_sync(account.id, holder).await {
            warn!("Failed to release sync claim, it lapses with its lease: {}", e);
        }
        outcome.duration_ms = timer.elapsed().as_millis() as u64;
        outcome
    }

    async fn sync_claimed(&self, account: &Account, force_full: bool) -> AccountSyncOutcome {
        let run_started_at = Utc::now();
        let mut outcome = AccountSyncOutcome::new(account);

        match self.attempt(account, force_full, run_started_at).await {
            Ok(progress) => {
                outcome.mode = Some(progress.mode);
                outcome.pages_fetched = progress.pages_fetched;
                outcome.new_messages = progress.new_messages.len();
                outcome.duplicates = progress.duplicates;
                outcome.truncated = progress.truncated;

                let success = if progress.truncated {
                    AttemptOutcome::Truncated {
                        attempted_at: run_started_at,
                    }
                } else {
                    AttemptOutcome::Succeeded { run_started_at }
                };
                match self.tracker.record(self.store.as_ref(), account.id, &success).await {
                    Ok(_) => {
                        outcome.queued_for_processing =
                            self.hand_off(account, progress.new_messages);
                    }
                    Err(e) => {
                        // Rows are persisted; the next run re-fetches the
                        // window and dedup discards what is already indexed.
                        error!("Failed to advance sync cursor: {}", e);
                        outcome.status = AccountSyncStatus::Failed;
                        outcome.error = Some(e.to_string());
                    }
                }
            }
            Err(e) if !e.is_failure() => {
                info!("Account skipped: {}", e);
                outcome.status = AccountSyncStatus::Skipped;
                outcome.error = Some(e.to_string());
            }
            Err(e) => {
                outcome.status = AccountSyncStatus::Failed;
                outcome.auth_required = e.is_auth();
                outcome.error = Some(e.to_string());

                let recorded = if e.is_auth() {
                    warn!("Credentials rejected, account flagged for re-authentication: {}", e);
                    format!("auth_expired: {e}")
                } else {
                    warn!("Account sync failed: {}", e);
                    e.to_string()
                };

                let failure = AttemptOutcome::Failed {
                    attempted_at: run_started_at,
                    error: recorded,
                };
                if let Err(save_err) =
                    self.tracker.record(self.store.as_ref(), account.id, &failure).await
                {
                    error!("Failed to record sync error: {}", save_err);
                }
            }
        }

        outcome
    }

    async fn attempt(
        &self,
        account: &Account,
        force_full: bool,
        run_started_at: DateTime<Utc>,
    ) -> Result<AccountProgress> {
        if force_full {
            info!("Forced full sync, clearing cursor");
            self.store.clear_sync_cursor(account.id).await?;
        }

        let cursor = self.store.get_sync_cursor(account.id).await?;

        if let (Some(limit), Some(cursor)) = (self.config.max_consecutive_failures, &cursor) {
            if cursor.consecutive_failures >= limit {
                return Err(SyncError::skipped(format!(
                    "{} consecutive failures, waiting for a forced sync",
                    cursor.consecutive_failures
                )));
            }
        }

        let window = self.tracker.next_window(cursor.as_ref(), run_started_at);
        debug!(mode = ?window.mode, since = %window.since, "Fetch window chosen");

        let adapter = self.providers.adapter_for(account.provider)?;
        let fetched = self.fetch_window(adapter.as_ref(), account, &window).await?;
        let (pages_fetched, duplicates) = (fetched.pages, fetched.duplicates);

        let created_at = Utc::now();
        let rows: Vec<NewIndexedMessage> = fetched
            .new
            .into_iter()
            .map(|m| NewIndexedMessage::from_incoming(account.id, m, created_at))
            .collect();
        let new_messages = self.store.insert_messages(&rows).await?;

        debug!(
            pages_fetched,
            new = new_messages.len(),
            duplicates,
            "Account batch persisted"
        );

        Ok(AccountProgress {
            mode: window.mode,
            pages_fetched,
            new_messages,
            duplicates,
            truncated: fetched.truncated,
        })
    }

    /// Pages through the window, deduplicating each page, until the provider
    /// is exhausted or `max_messages_per_run` new messages are collected.
    ///
    /// Only new messages count toward the cap, so a window re-fetched after a
    /// truncated run moves past what is already indexed.
    async fn fetch_window(
        &self,
        adapter: &dyn ProviderAdapter,
        account: &Account,
        window: &FetchWindow,
    ) -> Result<FetchedWindow> {
        let cap = self.config.max_messages_per_run.max(1);
        let timeout = Duration::from_secs(self.config.provider_timeout_seconds);
        let mut fetched = FetchedWindow {
            new: Vec::new(),
            duplicates: 0,
            pages: 0,
            truncated: false,
        };
        let mut seen: HashSet<String> = HashSet::new();
        let mut page_cursor: Option<PageCursor> = None;

        loop {
            let page = tokio::time::timeout(
                timeout,
                adapter.fetch_page(account, window, page_cursor.take()),
            )
            .await
            .map_err(|_| ProviderError::Timeout(self.config.provider_timeout_seconds))??;
            fetched.pages += 1;

            let dedup = self.dedup.reconcile(account.id, page.messages).await?;
            fetched.duplicates += dedup.duplicates.len();

            for message in dedup.new {
                // Repeats across pages of the same run.
                if let Some(key) = message.dedup_key() {
                    if !seen.insert(key.to_string()) {
                        fetched.duplicates += 1;
                        continue;
                    }
                }
                if fetched.new.len() >= cap {
                    fetched.truncated = true;
                    break;
                }
                fetched.new.push(message);
            }

            if fetched.truncated {
                debug!(cap, "Per-run message cap reached");
                break;
            }
            match page.next_page_cursor {
                Some(_) if fetched.new.len() >= cap => {
                    debug!(cap, "Per-run message cap reached at a page boundary");
                    fetched.truncated = true;
                    break;
                }
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }

        Ok(fetched)
    }

    fn hand_off(&self, account: &Account, messages: Vec<crate::mail::IndexedMessage>) -> bool {
        if messages.is_empty() {
            return false;
        }
        let Some(queue) = &self.queue else {
            return false;
        };

        let outcome = queue.try_enqueue(ProcessingJob {
            user_id: account.user_id,
            account_id: account.id,
            messages,
        });
        outcome == EnqueueOutcome::Enqueued
    }

    fn record_metrics(&self, report: &SyncReport, elapsed: Duration) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics
            .sync_run_duration_seconds
            .observe(elapsed.as_secs_f64());
        for (status, count) in [
            ("succeeded", report.accounts_succeeded),
            ("failed", report.accounts_failed),
            ("skipped", report.accounts_skipped),
        ] {
            metrics
                .accounts_synced_total
                .with_label_values(&[status])
                .inc_by(count as u64);
        }
        metrics
            .messages_indexed_total
            .inc_by(report.total_new_messages as u64);
        metrics
            .duplicates_discarded_total
            .inc_by(report.total_duplicates as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::ProviderKind;
    use crate::providers::FetchPage;
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;

    struct Paged {
        pages: Vec<Vec<IncomingMessage>>,
    }

    #[async_trait]
    impl ProviderAdapter for Paged {
        async fn fetch_page(
            &self,
            _account: &Account,
            _window: &FetchWindow,
            page_cursor: Option<PageCursor>,
        ) -> std::result::Result<FetchPage, ProviderError> {
            let index: usize = page_cursor.map(|c| c.0.parse().unwrap_or(0)).unwrap_or(0);
            let next = index + 1;
            Ok(FetchPage {
                messages: self.pages.get(index).cloned().unwrap_or_default(),
                next_page_cursor: (next < self.pages.len()).then(|| PageCursor(next.to_string())),
            })
        }
    }

    struct Hanging;

    #[async_trait]
    impl ProviderAdapter for Hanging {
        async fn fetch_page(
            &self,
            _account: &Account,
            _window: &FetchWindow,
            _page_cursor: Option<PageCursor>,
        ) -> std::result::Result<FetchPage, ProviderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(FetchPage::default())
        }
    }

    fn messages(prefix: &str, n: usize) -> Vec<IncomingMessage> {
        (0..n)
            .map(|i| IncomingMessage::new(format!("<{prefix}{i}@mail>"), Utc::now()))
            .collect()
    }

    async fn setup(adapter: Arc<dyn ProviderAdapter>, config: SyncConfig) -> (Arc<InMemoryStore>, SyncOrchestrator, Account) {
        let store = Arc::new(InMemoryStore::new());
        let account = Account::new(Uuid::new_v4(), "a@example.com", ProviderKind::Imap);
        store.upsert_account(&account).await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            ProviderRegistry::with_all(adapter),
            config,
        );
        (store, orchestrator, account)
    }

    #[tokio::test]
    async fn test_pages_are_followed_until_cap() {
        let adapter = Arc::new(Paged {
            pages: vec![messages("a", 3), messages("b", 3), messages("c", 3)],
        });
        let config = SyncConfig {
            max_messages_per_run: 5,
            ..SyncConfig::default()
        };
        let (store, orchestrator, account) = setup(adapter, config).await;

        let report = orchestrator.sync_account(account.id, false).await.unwrap();
        let outcome = report.outcome_for(account.id).unwrap();

        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(outcome.new_messages, 5);
        assert!(outcome.truncated);
        assert_eq!(store.list_indexed_messages(account.id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_realtime_run_only_touches_flagged_accounts() {
        let adapter = Arc::new(Paged {
            pages: vec![messages("rt", 2)],
        });
        let (store, orchestrator, polled) = setup(adapter, SyncConfig::default()).await;
        let realtime = Account::new(Uuid::new_v4(), "rt@example.com", ProviderKind::Google)
            .with_real_time_sync(true);
        store.upsert_account(&realtime).await.unwrap();

        let report = orchestrator.sync_realtime_accounts().await.unwrap();

        assert_eq!(report.accounts_attempted, 1);
        assert!(report.outcome_for(realtime.id).is_some());
        assert!(report.outcome_for(polled.id).is_none());
        assert!(store.get_sync_cursor(polled.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provider_timeout_is_a_failure() {
        let config = SyncConfig {
            provider_timeout_seconds: 0,
            ..SyncConfig::default()
        };
        let (store, orchestrator, account) = setup(Arc::new(Hanging), config).await;

        let report = orchestrator.sync_all_active_accounts().await.unwrap();
        assert!(!report.success);
        assert_eq!(report.accounts_failed, 1);

        let cursor = store.get_sync_cursor(account.id).await.unwrap().unwrap();
        assert_eq!(cursor.last_sync_at, None);
        assert_eq!(cursor.consecutive_failures, 1);
        assert!(cursor.sync_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_held_account_is_skipped() {
        let adapter = Arc::new(Paged { pages: vec![messages("a", 1)] });
        let (_store, orchestrator, account) = setup(adapter, SyncConfig::default()).await;

        let _held = orchestrator.locks().try_acquire(account.id).unwrap();
        let report = orchestrator.sync_account(account.id, false).await.unwrap();

        assert!(report.success);
        assert_eq!(report.accounts_skipped, 1);
        assert_eq!(report.total_new_messages, 0);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_found() {
        let adapter = Arc::new(Paged { pages: Vec::new() });
        let (_store, orchestrator, _account) = setup(adapter, SyncConfig::default()).await;
        let err = orchestrator.sync_account(Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }
}
