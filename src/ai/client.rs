use super::retry::{RetryConfig, RetryPolicy};
use super::{AiError, AiLayer, ClassificationResult, LearningResult, LearningWindow};
use crate::mail::IndexedMessage;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiClientConfig {
    /// Base URL of the AI service.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Timeout for a single classification call.
    pub timeout_seconds: u64,
    /// Learning passes run far longer than classification.
    pub learning_timeout_seconds: u64,
    pub retry: RetryConfig,
}

impl Default for AiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8091".to_string(),
            api_key: None,
            timeout_seconds: 60,
            learning_timeout_seconds: 900,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    indexed_message_id: Uuid,
    account_id: Uuid,
    message_id: Option<&'a str>,
    folder: &'a str,
    message_type: crate::mail::MessageType,
    received_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct LearningRequest<'a> {
    user_id: Uuid,
    window: &'a LearningWindow,
    account_hint: Option<Uuid>,
}

#[derive(Clone, Debug)]
pub struct HttpAiClient {
    config: AiClientConfig,
    base_url: Url,
    client: Client,
    retry: RetryPolicy,
}

impl HttpAiClient {
    pub fn new(config: AiClientConfig) -> Result<Self, AiError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| AiError::InvalidUrl(format!("Failed to parse URL: {e}")))?;
        if base_url.host_str().is_none() {
            return Err(AiError::InvalidUrl("URL must contain a host".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        let retry = RetryPolicy::new(config.retry.clone());

        Ok(Self {
            config,
            base_url,
            client,
            retry,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AiError> {
        self.base_url
            .join(path)
            .map_err(|e| AiError::InvalidUrl(e.to_string()))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B, timeout_seconds: u64) -> Result<T, AiError>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let url = self.endpoint(path)?;
        let mut request = self
            .client
            .post(url)
            .timeout(Duration::from_secs(timeout_seconds))
            .json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AiError::Timeout(timeout_seconds)
            } else {
                AiError::HttpError(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                    AiError::ServiceUnavailable(format!("HTTP {s}: {body}"))
                }
                s => AiError::Rejected(format!("HTTP {s}: {body}")),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AiError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl AiLayer for HttpAiClient {
    async fn classify_and_draft(
        &self,
        message: &IndexedMessage,
    ) -> Result<ClassificationResult, AiError> {
        let request = ClassifyRequest {
            indexed_message_id: message.id,
            account_id: message.account_id,
            message_id: message.message_id.as_deref(),
            folder: &message.folder,
            message_type: message.message_type,
            received_at: message.received_at,
        };

        debug!(indexed_message_id = %message.id, "Classifying message");
        self.retry
            .execute(
                || self.post_json("v1/classify", &request, self.config.timeout_seconds),
                AiError::is_retryable,
            )
            .await
    }

    async fn run_incremental_learning(
        &self,
        user_id: Uuid,
        window: &LearningWindow,
        account_hint: Option<Uuid>,
    ) -> Result<LearningResult, AiError> {
        let request = LearningRequest {
            user_id,
            window,
            account_hint,
        };

        info!(%user_id, new_messages = window.new_messages, "Starting incremental learning pass");
        let result: LearningResult = self
            .retry
            .execute(
                || {
                    self.post_json(
                        "v1/learning/incremental",
                        &request,
                        self.config.learning_timeout_seconds,
                    )
                },
                AiError::is_retryable,
            )
            .await?;

        if result.patterns_found < 0 {
            warn!(%user_id, patterns_found = result.patterns_found, "AI layer reported negative pattern count");
        }
        Ok(result)
    }

    async fn health_check(&self) -> Result<bool, AiError> {
        let url = self.endpoint("health")?;
        match self.client.get(url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!("AI service health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = AiClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8091");
        assert!(config.learning_timeout_seconds > config.timeout_seconds);
    }

    #[test]
    fn test_client_creation_with_invalid_url() {
        let config = AiClientConfig {
            base_url: "not-a-url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HttpAiClient::new(config),
            Err(AiError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AiError::ServiceUnavailable("busy".into()).is_retryable());
        assert!(AiError::Timeout(60).is_retryable());
        assert!(!AiError::Rejected("bad request".into()).is_retryable());
        assert!(!AiError::MalformedResponse("eof".into()).is_retryable());
    }
}
