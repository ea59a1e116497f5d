//! Provider adapters: one authenticated page fetch per call.
//!
//! The wire protocols (IMAP, Gmail/Graph REST, OAuth refresh) live outside
//! this crate. Each `ProviderKind` maps to exactly one `ProviderAdapter`
//! through `ProviderRegistry`, resolved once per account per run.

pub mod gateway;

use crate::mail::{Account, IncomingMessage, ProviderKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use gateway::{GatewayConfig, HttpGatewayAdapter};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    /// Token expired or revoked; needs out-of-band re-authentication.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Provider call timed out after {0}s")]
    Timeout(u64),
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("No adapter registered for provider {0}")]
    Unsupported(ProviderKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Only messages since the last successful cursor.
    Delta,
    /// Bounded window ending now, used when no usable cursor exists.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub mode: FetchMode,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

/// Opaque continuation token handed back by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor(pub String);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchPage {
    pub messages: Vec<IncomingMessage>,
    pub next_page_cursor: Option<PageCursor>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn fetch_page(
        &self,
        account: &Account,
        window: &FetchWindow,
        page_cursor: Option<PageCursor>,
    ) -> Result<FetchPage, ProviderError>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: ProviderKind, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    /// Registers the same adapter for every provider kind.
    pub fn with_all(adapter: Arc<dyn ProviderAdapter>) -> Self {
        [ProviderKind::Google, ProviderKind::Microsoft, ProviderKind::Imap]
            .into_iter()
            .fold(Self::new(), |registry, kind| {
                registry.register(kind, adapter.clone())
            })
    }

    pub fn adapter_for(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(ProviderError::Unsupported(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    #[async_trait]
    impl ProviderAdapter for Empty {
        async fn fetch_page(
            &self,
            _account: &Account,
            _window: &FetchWindow,
            _page_cursor: Option<PageCursor>,
        ) -> Result<FetchPage, ProviderError> {
            Ok(FetchPage::default())
        }
    }

    #[test]
    fn test_registry_resolves_registered_kinds_only() {
        let registry = ProviderRegistry::new().register(ProviderKind::Imap, Arc::new(Empty));
        assert!(registry.adapter_for(ProviderKind::Imap).is_ok());
        assert_eq!(
            registry.adapter_for(ProviderKind::Google).err(),
            Some(ProviderError::Unsupported(ProviderKind::Google))
        );
    }

    #[test]
    fn test_with_all_covers_every_kind() {
        let registry = ProviderRegistry::with_all(Arc::new(Empty));
        for kind in [ProviderKind::Google, ProviderKind::Microsoft, ProviderKind::Imap] {
            assert!(registry.adapter_for(kind).is_ok());
        }
    }
}
