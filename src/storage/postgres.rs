use super::{summarize_users, MailStore};
use crate::mail::{
    Account, ContentCache, IndexedMessage, LearningRun, LearningRunStatus, NewIndexedMessage,
    NotificationKind, NotificationRecord, Result, SyncCursor, UserSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

pub struct PgMailStore {
    pool: PgPool,
}

impl PgMailStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MailStore for PgMailStore {
    async fn upsert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, user_id, organization_id, email, provider, credentials_ref,
                active, real_time_sync, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                organization_id = EXCLUDED.organization_id,
                email = EXCLUDED.email,
                provider = EXCLUDED.provider,
                credentials_ref = EXCLUDED.credentials_ref,
                active = EXCLUDED.active,
                real_time_sync = EXCLUDED.real_time_sync
            "#,
        )
        .bind(account.id)
        .bind(account.user_id)
        .bind(account.organization_id)
        .bind(&account.email)
        .bind(account.provider)
        .bind(&account.credentials_ref)
        .bind(account.active)
        .bind(account.real_time_sync)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(accounts)
    }

    async fn list_active_accounts(&self) -> Result<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE active = TRUE ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let accounts = self.list_active_accounts().await?;
        Ok(summarize_users(&accounts))
    }

    async fn get_sync_cursor(&self, account_id: Uuid) -> Result<Option<SyncCursor>> {
        let cursor =
            sqlx::query_as::<_, SyncCursor>("SELECT * FROM sync_cursors WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }

    async fn save_sync_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (
                account_id, last_sync_at, sync_error, last_sync_attempt_at, consecutive_failures
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id) DO UPDATE SET
                last_sync_at = EXCLUDED.last_sync_at,
                sync_error = EXCLUDED.sync_error,
                last_sync_attempt_at = EXCLUDED.last_sync_attempt_at,
                consecutive_failures = EXCLUDED.consecutive_failures
            "#,
        )
        .bind(cursor.account_id)
        .bind(cursor.last_sync_at)
        .bind(&cursor.sync_error)
        .bind(cursor.last_sync_attempt_at)
        .bind(cursor.consecutive_failures)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_sync_cursor(&self, account_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sync_cursors WHERE account_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_claim_sync(&self, account_id: Uuid, holder: Uuid, lease: Duration) -> Result<bool> {
        let expires_at = Utc::now() + lease;
        let claimed = sqlx::query(
            r#"
            INSERT INTO sync_claims (account_id, holder, claimed_at, expires_at)
            VALUES ($1, $2, NOW(), $3)
            ON CONFLICT (account_id) DO UPDATE SET
                holder = EXCLUDED.holder,
                claimed_at = EXCLUDED.claimed_at,
                expires_at = EXCLUDED.expires_at
            WHERE sync_claims.expires_at < NOW()
            "#,
        )
        .bind(account_id)
        .bind(holder)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        let won = claimed.rows_affected() == 1;
        if !won {
            debug!(%account_id, "Sync claim held by another process");
        }
        Ok(won)
    }

    async fn release_sync(&self, account_id: Uuid, holder: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sync_claims WHERE account_id = $1 AND holder = $2")
            .bind(account_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn existing_message_ids(
        &self,
        account_id: Uuid,
        message_ids: &[String],
    ) -> Result<HashSet<String>> {
        if message_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT message_id FROM indexed_messages
            WHERE account_id = $1 AND message_id = ANY($2)
            "#,
        )
        .bind(account_id)
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn insert_messages(&self, messages: &[NewIndexedMessage]) -> Result<Vec<IndexedMessage>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(messages.len());

        for message in messages {
            let id = Uuid::new_v4();
            let cache_id = message.body.as_ref().map(|_| Uuid::new_v4());

            let row = sqlx::query_as::<_, IndexedMessage>(
                r#"
                INSERT INTO indexed_messages (
                    id, account_id, message_id, folder, message_type,
                    received_at, created_at, content_cache_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(message.account_id)
            .bind(&message.message_id)
            .bind(&message.folder)
            .bind(message.message_type)
            .bind(message.received_at)
            .bind(message.created_at)
            .bind(cache_id)
            .fetch_one(&mut *tx)
            .await?;

            if let (Some(cache_id), Some(body)) = (cache_id, message.body.as_ref()) {
                sqlx::query(
                    r#"
                    INSERT INTO content_cache (
                        id, indexed_message_id, account_id, message_id,
                        subject, body, content_hash, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(cache_id)
                .bind(id)
                .bind(message.account_id)
                .bind(&message.message_id)
                .bind(&message.subject)
                .bind(body)
                .bind(ContentCache::calculate_content_hash(&message.subject, body))
                .bind(message.created_at)
                .execute(&mut *tx)
                .await?;
            }

            inserted.push(row);
        }

        tx.commit().await?;
        debug!(count = inserted.len(), "Inserted indexed messages");
        Ok(inserted)
    }

    async fn list_indexed_messages(&self, account_id: Uuid) -> Result<Vec<IndexedMessage>> {
        let rows = sqlx::query_as::<_, IndexedMessage>(
            "SELECT * FROM indexed_messages WHERE account_id = $1 ORDER BY created_at, id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_messages(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let caches = sqlx::query("DELETE FROM content_cache WHERE indexed_message_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        let messages = sqlx::query("DELETE FROM indexed_messages WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            messages_deleted = messages.rows_affected(),
            content_rows_deleted = caches.rows_affected(),
            "Deleted duplicate messages"
        );
        Ok(messages.rows_affected())
    }

    async fn count_messages_for_user(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM indexed_messages m
            JOIN accounts a ON a.id = m.account_id
            WHERE a.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_messages_for_user_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM indexed_messages m
            JOIN accounts a ON a.id = m.account_id
            WHERE a.user_id = $1 AND m.created_at >= $2
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn last_completed_learning_run(&self, user_id: Uuid) -> Result<Option<LearningRun>> {
        let run = sqlx::query_as::<_, LearningRun>(
            r#"
            SELECT * FROM learning_runs
            WHERE user_id = $1 AND status = $2
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(LearningRunStatus::Completed)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    async fn record_learning_run(&self, run: &LearningRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO learning_runs (
                id, user_id, started_at, completed_at, status, messages_considered,
                patterns_created, patterns_updated, quality_score
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.user_id)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.status)
        .bind(run.messages_considered)
        .bind(run.patterns_created)
        .bind(run.patterns_updated)
        .bind(run.quality_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_patterns(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM patterns WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn notification_exists(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        milestone_type: &str,
        milestone_value: i64,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM notification_records
                WHERE user_id = $1 AND kind = $2 AND milestone_type = $3 AND milestone_value = $4
            )
            "#,
        )
        .bind(user_id)
        .bind(kind)
        .bind(milestone_type)
        .bind(milestone_value)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_notification_if_absent(&self, record: &NotificationRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_records (
                id, user_id, kind, milestone_type, milestone_value, sent_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT ON CONSTRAINT uq_notification_key DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.kind)
        .bind(&record.milestone_type)
        .bind(record.milestone_value)
        .bind(record.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
