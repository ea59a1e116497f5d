//! Persistence seam for the sync and learning core.
//!
//! `MailStore` is the narrow interface the services depend on. `PgMailStore`
//! is the production implementation over PostgreSQL; `InMemoryStore` backs
//! tests and dry runs.

pub mod connection;
pub mod in_memory;
pub mod postgres;

use crate::mail::{
    Account, IndexedMessage, LearningRun, NewIndexedMessage, NotificationKind,
    NotificationRecord, Result, SyncCursor, UserSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use uuid::Uuid;

pub use connection::{create_pool, run_migrations};
pub use in_memory::InMemoryStore;
pub use postgres::PgMailStore;

#[async_trait]
pub trait MailStore: Send + Sync {
    async fn upsert_account(&self, account: &Account) -> Result<()>;

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    async fn list_active_accounts(&self) -> Result<Vec<Account>>;

    /// Users owning at least one active account.
    async fn list_users(&self) -> Result<Vec<UserSummary>>;

    async fn get_sync_cursor(&self, account_id: Uuid) -> Result<Option<SyncCursor>>;

    async fn save_sync_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    async fn clear_sync_cursor(&self, account_id: Uuid) -> Result<()>;

    /// Claims the account's sync for `holder` until `lease` elapses. Returns
    /// false while another holder's lease is live. Visible to every process
    /// sharing the store.
    async fn try_claim_sync(&self, account_id: Uuid, holder: Uuid, lease: Duration) -> Result<bool>;

    /// Drops the claim if `holder` still owns it.
    async fn release_sync(&self, account_id: Uuid, holder: Uuid) -> Result<()>;

    /// Subset of `message_ids` already indexed for the account.
    async fn existing_message_ids(
        &self,
        account_id: Uuid,
        message_ids: &[String],
    ) -> Result<HashSet<String>>;

    /// Persists content bodies and message rows. Callers dedup first.
    async fn insert_messages(&self, messages: &[NewIndexedMessage]) -> Result<Vec<IndexedMessage>>;

    async fn list_indexed_messages(&self, account_id: Uuid) -> Result<Vec<IndexedMessage>>;

    /// Deletes the given message rows, removing their content cache rows first.
    async fn delete_messages(&self, ids: &[Uuid]) -> Result<u64>;

    async fn count_messages_for_user(&self, user_id: Uuid) -> Result<i64>;

    /// Messages first seen (`created_at`) at or after `since`.
    async fn count_messages_for_user_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    async fn last_completed_learning_run(&self, user_id: Uuid) -> Result<Option<LearningRun>>;

    async fn record_learning_run(&self, run: &LearningRun) -> Result<()>;

    async fn count_patterns(&self, user_id: Uuid) -> Result<i64>;

    async fn notification_exists(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        milestone_type: &str,
        milestone_value: i64,
    ) -> Result<bool>;

    /// Atomic insert-if-absent on (user, kind, type, value). Returns true when
    /// this call created the record.
    async fn insert_notification_if_absent(&self, record: &NotificationRecord) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

/// Groups active accounts by owning user, keeping account order stable.
pub fn summarize_users(accounts: &[Account]) -> Vec<UserSummary> {
    let mut users: Vec<UserSummary> = Vec::new();
    for account in accounts.iter().filter(|a| a.active) {
        match users.iter_mut().find(|u| u.user_id == account.user_id) {
            Some(user) => {
                user.account_ids.push(account.id);
                if user.organization_id.is_none() {
                    user.organization_id = account.organization_id;
                }
            }
            None => users.push(UserSummary {
                user_id: account.user_id,
                organization_id: account.organization_id,
                account_ids: vec![account.id],
            }),
        }
    }
    users
}
