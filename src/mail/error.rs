use thiserror::Error;

use crate::ai::AiError;
use crate::providers::ProviderError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transient provider error: {message}")]
    TransientProvider { message: String },

    #[error("Authentication expired or revoked: {message}")]
    Auth { message: String },

    #[error("Partial batch failure: {failed} of {total} items failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("Skipped by policy: {reason}")]
    SkippedByPolicy { reason: String },

    #[error("Data integrity anomaly: {message}")]
    DataIntegrityAnomaly { message: String },

    #[error("Sync already in progress for account {account_id}")]
    AlreadyInProgress { account_id: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("AI layer error: {0}")]
    Ai(#[from] AiError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SyncError {
    /// Policy skips are reported as "skipped" rather than "failed".
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            SyncError::SkippedByPolicy { .. } | SyncError::AlreadyInProgress { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth { .. })
    }

    pub fn anomaly(message: impl Into<String>) -> Self {
        SyncError::DataIntegrityAnomaly {
            message: message.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        SyncError::SkippedByPolicy {
            reason: reason.into(),
        }
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::AuthExpired(message) => SyncError::Auth { message },
            // Missing wiring, not a provider hiccup; retrying cannot help.
            unsupported @ ProviderError::Unsupported(_) => {
                SyncError::Configuration(unsupported.to_string())
            }
            other => SyncError::TransientProvider {
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::ProviderKind;

    #[test]
    fn test_provider_errors_map_to_taxonomy() {
        let auth: SyncError = ProviderError::AuthExpired("token revoked".into()).into();
        assert!(auth.is_auth());
        assert!(auth.is_failure());

        let transient: SyncError = ProviderError::RateLimited("slow down".into()).into();
        assert!(matches!(transient, SyncError::TransientProvider { .. }));

        let timeout: SyncError = ProviderError::Timeout(30).into();
        assert!(timeout.to_string().contains("timed out"));

        let unsupported: SyncError = ProviderError::Unsupported(ProviderKind::Imap).into();
        assert!(matches!(unsupported, SyncError::Configuration(_)));
        assert!(unsupported.is_failure());
    }

    #[test]
    fn test_policy_skips_are_not_failures() {
        assert!(!SyncError::skipped("too soon").is_failure());
        assert!(!SyncError::AlreadyInProgress {
            account_id: "a".into()
        }
        .is_failure());
        assert!(SyncError::anomaly("negative delta").is_failure());
    }
}
