//! Process-local `MailStore` used by the test suite and `--dry-run` style
//! invocations. Mirrors the Postgres semantics, including delete ordering
//! and the unique key on notification records.

use super::{summarize_users, MailStore};
use crate::mail::{
    Account, ContentCache, IndexedMessage, LearningRun, LearningRunStatus, NewIndexedMessage,
    NotificationKind, NotificationRecord, Pattern, Result, SyncCursor, SyncError, UserSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    accounts: Vec<Account>,
    cursors: HashMap<Uuid, SyncCursor>,
    /// account id -> (holder, lease expiry)
    claims: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
    messages: Vec<IndexedMessage>,
    content: Vec<ContentCache>,
    learning_runs: Vec<LearningRun>,
    patterns: Vec<Pattern>,
    notifications: Vec<NotificationRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_pattern(&self, user_id: Uuid, description: impl Into<String>) -> Pattern {
        let now = Utc::now();
        let pattern = Pattern {
            id: Uuid::new_v4(),
            user_id,
            description: description.into(),
            created_at: now,
            updated_at: now,
        };
        self.tables.write().await.patterns.push(pattern.clone());
        pattern
    }

    pub async fn content_rows(&self, account_id: Uuid) -> Vec<ContentCache> {
        self.tables
            .read()
            .await
            .content
            .iter()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn learning_runs(&self, user_id: Uuid) -> Vec<LearningRun> {
        self.tables
            .read()
            .await
            .learning_runs
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn notifications(&self, user_id: Uuid) -> Vec<NotificationRecord> {
        self.tables
            .read()
            .await
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MailStore for InMemoryStore {
    async fn upsert_account(&self, account: &Account) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account.clone(),
            None => tables.accounts.push(account.clone()),
        }
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.iter().find(|a| a.id == account_id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.tables.read().await.accounts.clone())
    }

    async fn list_active_accounts(&self) -> Result<Vec<Account>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.iter().filter(|a| a.active).cloned().collect())
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let tables = self.tables.read().await;
        Ok(summarize_users(&tables.accounts))
    }

    async fn get_sync_cursor(&self, account_id: Uuid) -> Result<Option<SyncCursor>> {
        Ok(self.tables.read().await.cursors.get(&account_id).cloned())
    }

    async fn save_sync_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.accounts.iter().any(|a| a.id == cursor.account_id) {
            return Err(SyncError::NotFound {
                what: format!("account {}", cursor.account_id),
            });
        }
        tables.cursors.insert(cursor.account_id, cursor.clone());
        Ok(())
    }

    async fn clear_sync_cursor(&self, account_id: Uuid) -> Result<()> {
        self.tables.write().await.cursors.remove(&account_id);
        Ok(())
    }

    async fn try_claim_sync(&self, account_id: Uuid, holder: Uuid, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        match tables.claims.get(&account_id) {
            Some((_, expires_at)) if *expires_at >= now => Ok(false),
            _ => {
                tables.claims.insert(account_id, (holder, now + lease));
                Ok(true)
            }
        }
    }

    async fn release_sync(&self, account_id: Uuid, holder: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.claims.get(&account_id).is_some_and(|(h, _)| *h == holder) {
            tables.claims.remove(&account_id);
        }
        Ok(())
    }

    async fn existing_message_ids(
        &self,
        account_id: Uuid,
        message_ids: &[String],
    ) -> Result<HashSet<String>> {
        let wanted: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.account_id == account_id)
            .filter_map(|m| m.message_id.as_deref())
            .filter(|id| wanted.contains(id))
            .map(str::to_string)
            .collect())
    }

    async fn insert_messages(&self, messages: &[NewIndexedMessage]) -> Result<Vec<IndexedMessage>> {
        let mut tables = self.tables.write().await;
        let mut inserted = Vec::with_capacity(messages.len());

        for message in messages {
            let id = Uuid::new_v4();
            let cache_id = message.body.as_ref().map(|_| Uuid::new_v4());
            let row = IndexedMessage {
                id,
                account_id: message.account_id,
                message_id: message.message_id.clone(),
                folder: message.folder.clone(),
                message_type: message.message_type,
                received_at: message.received_at,
                created_at: message.created_at,
                content_cache_id: cache_id,
            };

            if let (Some(cache_id), Some(body)) = (cache_id, message.body.as_ref()) {
                tables.content.push(ContentCache {
                    id: cache_id,
                    indexed_message_id: id,
                    account_id: message.account_id,
                    message_id: message.message_id.clone(),
                    subject: message.subject.clone(),
                    body: body.clone(),
                    content_hash: ContentCache::calculate_content_hash(&message.subject, body),
                    created_at: message.created_at,
                });
            }

            tables.messages.push(row.clone());
            inserted.push(row);
        }

        Ok(inserted)
    }

    async fn list_indexed_messages(&self, account_id: Uuid) -> Result<Vec<IndexedMessage>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<IndexedMessage> = tables
            .messages
            .iter()
            .filter(|m| m.account_id == account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn delete_messages(&self, ids: &[Uuid]) -> Result<u64> {
        let doomed: HashSet<Uuid> = ids.iter().copied().collect();
        let mut tables = self.tables.write().await;

        tables
            .content
            .retain(|c| !doomed.contains(&c.indexed_message_id));

        let before = tables.messages.len();
        tables.messages.retain(|m| !doomed.contains(&m.id));
        Ok((before - tables.messages.len()) as u64)
    }

    async fn count_messages_for_user(&self, user_id: Uuid) -> Result<i64> {
        let tables = self.tables.read().await;
        let accounts = user_account_ids(&tables, user_id);
        Ok(tables
            .messages
            .iter()
            .filter(|m| accounts.contains(&m.account_id))
            .count() as i64)
    }

    async fn count_messages_for_user_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let tables = self.tables.read().await;
        let accounts = user_account_ids(&tables, user_id);
        Ok(tables
            .messages
            .iter()
            .filter(|m| accounts.contains(&m.account_id) && m.created_at >= since)
            .count() as i64)
    }

    async fn last_completed_learning_run(&self, user_id: Uuid) -> Result<Option<LearningRun>> {
        let tables = self.tables.read().await;
        Ok(tables
            .learning_runs
            .iter()
            .filter(|r| r.user_id == user_id && r.status == LearningRunStatus::Completed)
            .max_by_key(|r| r.completed_at)
            .cloned())
    }

    async fn record_learning_run(&self, run: &LearningRun) -> Result<()> {
        self.tables.write().await.learning_runs.push(run.clone());
        Ok(())
    }

    async fn count_patterns(&self, user_id: Uuid) -> Result<i64> {
        let tables = self.tables.read().await;
        Ok(tables.patterns.iter().filter(|p| p.user_id == user_id).count() as i64)
    }

    async fn notification_exists(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        milestone_type: &str,
        milestone_value: i64,
    ) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables.notifications.iter().any(|n| {
            n.user_id == user_id
                && n.kind == kind
                && n.milestone_type == milestone_type
                && n.milestone_value == milestone_value
        }))
    }

    async fn insert_notification_if_absent(&self, record: &NotificationRecord) -> Result<bool> {
        // Check and insert under one write lock.
        let mut tables = self.tables.write().await;
        let exists = tables.notifications.iter().any(|n| {
            n.user_id == record.user_id
                && n.kind == record.kind
                && n.milestone_type == record.milestone_type
                && n.milestone_value == record.milestone_value
        });
        if exists {
            return Ok(false);
        }
        tables.notifications.push(record.clone());
        Ok(true)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn user_account_ids(tables: &Tables, user_id: Uuid) -> HashSet<Uuid> {
    tables
        .accounts
        .iter()
        .filter(|a| a.user_id == user_id)
        .map(|a| a.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{IncomingMessage, ProviderKind};

    #[tokio::test]
    async fn test_delete_removes_content_before_messages() {
        let store = InMemoryStore::new();
        let account = Account::new(Uuid::new_v4(), "a@example.com", ProviderKind::Imap);
        store.upsert_account(&account).await.unwrap();

        let mut incoming = IncomingMessage::new("<1@x>", Utc::now());
        incoming.body = Some("hello".into());
        let rows = store
            .insert_messages(&[NewIndexedMessage::from_incoming(account.id, incoming, Utc::now())])
            .await
            .unwrap();
        assert_eq!(store.content_rows(account.id).await.len(), 1);

        let deleted = store.delete_messages(&[rows[0].id]).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.content_rows(account.id).await.is_empty());
        assert!(store.list_indexed_messages(account.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_claim_is_exclusive_until_released() {
        let store = InMemoryStore::new();
        let account = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let lease = Duration::minutes(5);

        assert!(store.try_claim_sync(account, first, lease).await.unwrap());
        assert!(!store.try_claim_sync(account, second, lease).await.unwrap());

        // Only the holder can release.
        store.release_sync(account, second).await.unwrap();
        assert!(!store.try_claim_sync(account, second, lease).await.unwrap());

        store.release_sync(account, first).await.unwrap();
        assert!(store.try_claim_sync(account, second, lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_notification_insert_if_absent_is_idempotent() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let first = NotificationRecord::new(user, NotificationKind::Milestone, "emails_processed", 100);
        let second = NotificationRecord::new(user, NotificationKind::Milestone, "emails_processed", 100);

        assert!(store.insert_notification_if_absent(&first).await.unwrap());
        assert!(!store.insert_notification_if_absent(&second).await.unwrap());
        assert_eq!(store.notifications(user).await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_users_groups_accounts() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let org = Uuid::new_v4();
        let a = Account::new(user, "a@example.com", ProviderKind::Google);
        let b = Account::new(user, "b@example.com", ProviderKind::Microsoft).with_organization(org);
        let mut inactive = Account::new(Uuid::new_v4(), "c@example.com", ProviderKind::Imap);
        inactive.active = false;
        for account in [&a, &b, &inactive] {
            store.upsert_account(account).await.unwrap();
        }

        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].account_ids, vec![a.id, b.id]);
        assert_eq!(users[0].organization_id, Some(org));
    }
}
