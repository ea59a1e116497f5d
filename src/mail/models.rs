use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Mail provider family. Picks the adapter once per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "provider_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Microsoft,
    Imap,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Microsoft => "microsoft",
            ProviderKind::Imap => "imap",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "google" | "gmail" => Ok(ProviderKind::Google),
            "microsoft" | "outlook" => Ok(ProviderKind::Microsoft),
            "imap" => Ok(ProviderKind::Imap),
            _ => Err(format!("Invalid provider kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Inbox,
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "learning_run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LearningRunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "notification_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Milestone,
    WeeklyUpdate,
}

/// One connected mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub email: String,
    pub provider: ProviderKind,
    /// Opaque reference into the credential vault; never the secret itself.
    pub credentials_ref: String,
    pub active: bool,
    pub real_time_sync: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(user_id: Uuid, email: impl Into<String>, provider: ProviderKind) -> Self {
        let email = email.into();
        Self {
            id: Uuid::new_v4(),
            user_id,
            organization_id: None,
            credentials_ref: format!("{provider}:{email}"),
            email,
            provider,
            active: true,
            real_time_sync: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn with_real_time_sync(mut self, enabled: bool) -> Self {
        self.real_time_sync = enabled;
        self
    }
}

/// Per-account synchronization cursor, stored beside the account row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SyncCursor {
    pub account_id: Uuid,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
}

impl SyncCursor {
    pub fn empty(account_id: Uuid) -> Self {
        Self {
            account_id,
            last_sync_at: None,
            sync_error: None,
            last_sync_attempt_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Metadata row for one message, keyed by (account_id, message_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct IndexedMessage {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Provider-issued identifier, kept verbatim. `None` lands in the unknown bucket.
    pub message_id: Option<String>,
    pub folder: String,
    pub message_type: MessageType,
    pub received_at: DateTime<Utc>,
    /// First time this system saw the message.
    pub created_at: DateTime<Utc>,
    pub content_cache_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ContentCache {
    pub id: Uuid,
    /// Owning message row; the cache row is deleted before its owner.
    pub indexed_message_id: Uuid,
    pub account_id: Uuid,
    pub message_id: Option<String>,
    pub subject: String,
    pub body: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ContentCache {
    pub fn calculate_content_hash(subject: &str, body: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(body.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A raw message record as returned by a provider page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: Option<String>,
    pub folder: String,
    pub message_type: MessageType,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
}

impl IncomingMessage {
    pub fn new(message_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            folder: "INBOX".to_string(),
            message_type: MessageType::Inbox,
            received_at,
            subject: String::new(),
            body: None,
        }
    }

    /// The provider id verbatim, or `None` when it is missing or blank.
    pub fn dedup_key(&self) -> Option<&str> {
        self.message_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }
}

/// Insert payload for a message that passed dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIndexedMessage {
    pub account_id: Uuid,
    pub message_id: Option<String>,
    pub folder: String,
    pub message_type: MessageType,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub subject: String,
    pub body: Option<String>,
}

impl NewIndexedMessage {
    pub fn from_incoming(
        account_id: Uuid,
        incoming: IncomingMessage,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id,
            message_id: incoming.message_id,
            folder: incoming.folder,
            message_type: incoming.message_type,
            received_at: incoming.received_at,
            created_at,
            subject: incoming.subject,
            body: incoming.body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LearningRun {
    pub id: Uuid,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: LearningRunStatus,
    pub messages_considered: i64,
    pub patterns_created: i64,
    pub patterns_updated: i64,
    pub quality_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Pattern {
    pub id: Uuid,
    pub user_id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Idempotency marker; its existence suppresses a re-send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub milestone_type: String,
    pub milestone_value: i64,
    pub sent_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(
        user_id: Uuid,
        kind: NotificationKind,
        milestone_type: impl Into<String>,
        milestone_value: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            milestone_type: milestone_type.into(),
            milestone_value,
            sent_at: Utc::now(),
        }
    }
}

/// A user with at least one active account, as seen by the learning and
/// milestone jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub account_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("google".parse::<ProviderKind>(), Ok(ProviderKind::Google));
        assert_eq!("Outlook".parse::<ProviderKind>(), Ok(ProviderKind::Microsoft));
        assert_eq!("IMAP".parse::<ProviderKind>(), Ok(ProviderKind::Imap));
        assert!("pop3".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_blank_message_id_has_no_dedup_key() {
        let mut msg = IncomingMessage::new("  ", Utc::now());
        assert_eq!(msg.dedup_key(), None);

        msg.message_id = Some("<abc@example.com>".into());
        assert_eq!(msg.dedup_key(), Some("<abc@example.com>"));
    }

    #[test]
    fn test_message_id_is_stored_verbatim() {
        let incoming = IncomingMessage::new(" <padded@example.com> ", Utc::now());
        assert_eq!(incoming.dedup_key(), Some(" <padded@example.com> "));

        let row = NewIndexedMessage::from_incoming(Uuid::new_v4(), incoming, Utc::now());
        assert_eq!(row.message_id.as_deref(), Some(" <padded@example.com> "));
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = ContentCache::calculate_content_hash("hi", "body");
        let b = ContentCache::calculate_content_hash("hi", "body");
        let c = ContentCache::calculate_content_hash("hib", "ody");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
