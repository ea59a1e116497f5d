//! Shared fixtures: a scripted provider adapter and store seeding helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailflow_core::mail::{Account, IncomingMessage, NewIndexedMessage, ProviderKind};
use mailflow_core::providers::{FetchPage, FetchWindow, PageCursor, ProviderAdapter, ProviderError};
use mailflow_core::storage::{InMemoryStore, MailStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone)]
pub enum Script {
    /// Pages served in order; the last page has no continuation token.
    Pages(Vec<Vec<IncomingMessage>>),
    Fail(fn() -> ProviderError),
}

/// Serves a fixed script per account and records every window requested.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<Uuid, Script>>,
    windows: Mutex<Vec<(Uuid, FetchWindow)>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn script(&self, account_id: Uuid, script: Script) {
        self.scripts.lock().await.insert(account_id, script);
    }

    pub async fn windows_for(&self, account_id: Uuid) -> Vec<FetchWindow> {
        self.windows
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id == account_id)
            .map(|(_, w)| *w)
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    async fn fetch_page(
        &self,
        account: &Account,
        window: &FetchWindow,
        page_cursor: Option<PageCursor>,
    ) -> Result<FetchPage, ProviderError> {
        if page_cursor.is_none() {
            self.windows.lock().await.push((account.id, *window));
        }
        let script = self.scripts.lock().await.get(&account.id).cloned();
        match script {
            None => Ok(FetchPage::default()),
            Some(Script::Fail(make)) => Err(make()),
            Some(Script::Pages(pages)) => {
                let index: usize = page_cursor
                    .as_ref()
                    .and_then(|c| c.0.parse().ok())
                    .unwrap_or(0);
                let messages = pages.get(index).cloned().unwrap_or_default();
                let next_page_cursor =
                    (index + 1 < pages.len()).then(|| PageCursor((index + 1).to_string()));
                Ok(FetchPage {
                    messages,
                    next_page_cursor,
                })
            }
        }
    }
}

pub fn messages(prefix: &str, range: std::ops::Range<usize>) -> Vec<IncomingMessage> {
    range
        .map(|i| IncomingMessage::new(format!("<{prefix}-{i}@example.com>"), Utc::now()))
        .collect()
}

pub async fn seed_account(store: &InMemoryStore, organization: Option<Uuid>) -> Account {
    let mut account = Account::new(Uuid::new_v4(), "owner@example.com", ProviderKind::Google);
    if let Some(org) = organization {
        account = account.with_organization(org);
    }
    store.upsert_account(&account).await.unwrap();
    account
}

/// Inserts `count` indexed rows first seen at `created_at`.
pub async fn seed_indexed(
    store: &InMemoryStore,
    account_id: Uuid,
    prefix: &str,
    count: usize,
    created_at: DateTime<Utc>,
) {
    let rows: Vec<_> = messages(prefix, 0..count)
        .into_iter()
        .map(|m| NewIndexedMessage::from_incoming(account_id, m, created_at))
        .collect();
    store.insert_messages(&rows).await.unwrap();
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}
