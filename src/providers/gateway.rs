//! HTTP adapter for a provider gateway service.
//!
//! The gateway owns IMAP sessions and OAuth token refresh for Google and
//! Microsoft accounts and exposes one JSON endpoint per provider kind:
//! `POST {base_url}/v1/{provider}/messages`.

use super::{FetchPage, FetchWindow, PageCursor, ProviderAdapter, ProviderError};
use crate::mail::{Account, IncomingMessage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
    pub timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            api_key: None,
            page_size: 100,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Serialize)]
struct FetchRequest<'a> {
    account_id: Uuid,
    email: &'a str,
    credentials_ref: &'a str,
    since: chrono::DateTime<chrono::Utc>,
    until: chrono::DateTime<chrono::Utc>,
    mode: super::FetchMode,
    page_cursor: Option<&'a str>,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    messages: Vec<IncomingMessage>,
    next_page_cursor: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HttpGatewayAdapter {
    config: GatewayConfig,
    base_url: Url,
    client: Client,
}

impl HttpGatewayAdapter {
    pub fn new(config: GatewayConfig) -> Result<Self, ProviderError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ProviderError::Provider(format!("Invalid gateway URL: {e}")))?;

        if base_url.host_str().is_none() {
            return Err(ProviderError::Provider(
                "Gateway URL must contain a host".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    fn endpoint(&self, account: &Account) -> Result<Url, ProviderError> {
        self.base_url
            .join(&format!("v1/{}/messages", account.provider))
            .map_err(|e| ProviderError::Provider(format!("Invalid gateway endpoint: {e}")))
    }
}

/// Maps gateway HTTP status codes onto the provider error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthExpired(body),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::Network(format!("HTTP {status}: {body}"))
        }
        s if s.is_server_error() => ProviderError::Network(format!("HTTP {s}: {body}")),
        s => ProviderError::Provider(format!("HTTP {s}: {body}")),
    }
}

#[async_trait]
impl ProviderAdapter for HttpGatewayAdapter {
    async fn fetch_page(
        &self,
        account: &Account,
        window: &FetchWindow,
        page_cursor: Option<PageCursor>,
    ) -> Result<FetchPage, ProviderError> {
        let url = self.endpoint(account)?;
        let request = FetchRequest {
            account_id: account.id,
            email: &account.email,
            credentials_ref: &account.credentials_ref,
            since: window.since,
            until: window.until,
            mode: window.mode,
            page_cursor: page_cursor.as_ref().map(|c| c.0.as_str()),
            page_size: self.config.page_size,
        };

        debug!(account_id = %account.id, provider = %account.provider, "Fetching provider page");

        let mut builder = self.client.post(url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.config.timeout_seconds)
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let payload: FetchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Provider(format!("Malformed gateway response: {e}")))?;

        Ok(FetchPage {
            messages: payload.messages,
            next_page_cursor: payload.next_page_cursor.map(PageCursor),
        })
    }
}
