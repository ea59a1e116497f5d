//! Seam to the external AI layer: per-message classification/drafting and
//! incremental pattern learning. Model invocation lives behind `AiLayer`.

pub mod client;
pub mod mock;
pub mod retry;

use crate::mail::IndexedMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use client::{AiClientConfig, HttpAiClient};
pub use mock::MockAiLayer;
pub use retry::{RetryConfig, RetryPolicy};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("AI service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Request rejected by AI service: {0}")]
    Rejected(String),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("AI call timed out after {0}s")]
    Timeout(u64),
}

impl AiError {
    /// Errors worth another attempt within the same call.
    pub fn is_retryable(&self) -> bool {
        match self {
            AiError::HttpError(e) => e.is_timeout() || e.is_connect(),
            AiError::ServiceUnavailable(_) | AiError::Timeout(_) => true,
            AiError::InvalidUrl(_) | AiError::Rejected(_) | AiError::MalformedResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub indexed_message_id: Uuid,
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub draft: Option<String>,
}

/// Bounded slice of mail handed to an incremental learning pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub new_messages: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningResult {
    /// Total patterns the pass touched, created or updated.
    pub patterns_found: i64,
    pub quality_score: Option<f64>,
}

#[async_trait]
pub trait AiLayer: Send + Sync {
    async fn classify_and_draft(
        &self,
        message: &IndexedMessage,
    ) -> Result<ClassificationResult, AiError>;

    async fn run_incremental_learning(
        &self,
        user_id: Uuid,
        window: &LearningWindow,
        account_hint: Option<Uuid>,
    ) -> Result<LearningResult, AiError>;

    async fn health_check(&self) -> Result<bool, AiError>;
}
