//! Scriptable `AiLayer` for tests and dry runs.

use super::{AiError, AiLayer, ClassificationResult, LearningResult, LearningWindow};
use crate::mail::IndexedMessage;
use crate::storage::InMemoryStore;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LearningCall {
    pub user_id: Uuid,
    pub window: LearningWindow,
    pub account_hint: Option<Uuid>,
}

pub struct MockAiLayer {
    failing_message_ids: HashSet<String>,
    learning_result: Option<LearningResult>,
    patterns_per_run: usize,
    pattern_store: Option<Arc<InMemoryStore>>,
    classify_calls: AtomicUsize,
    learning_calls: Mutex<Vec<LearningCall>>,
}

impl MockAiLayer {
    pub fn new() -> Self {
        Self {
            failing_message_ids: HashSet::new(),
            learning_result: Some(LearningResult {
                patterns_found: 0,
                quality_score: Some(0.8),
            }),
            patterns_per_run: 0,
            pattern_store: None,
            classify_calls: AtomicUsize::new(0),
            learning_calls: Mutex::new(Vec::new()),
        }
    }

    /// Classification fails for messages carrying this provider id.
    pub fn failing_on(mut self, message_id: impl Into<String>) -> Self {
        self.failing_message_ids.insert(message_id.into());
        self
    }

    pub fn with_learning_result(mut self, patterns_found: i64, quality_score: Option<f64>) -> Self {
        self.learning_result = Some(LearningResult {
            patterns_found,
            quality_score,
        });
        self
    }

    /// Every learning call fails with `ServiceUnavailable`.
    pub fn with_failing_learning(mut self) -> Self {
        self.learning_result = None;
        self
    }

    /// Each learning call writes `count` new patterns for the user, the way
    /// the real learning layer mutates the pattern table.
    pub fn creating_patterns(mut self, store: Arc<InMemoryStore>, count: usize) -> Self {
        self.pattern_store = Some(store);
        self.patterns_per_run = count;
        self
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub async fn learning_calls(&self) -> Vec<LearningCall> {
        self.learning_calls.lock().await.clone()
    }
}

impl Default for MockAiLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiLayer for MockAiLayer {
    async fn classify_and_draft(
        &self,
        message: &IndexedMessage,
    ) -> Result<ClassificationResult, AiError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(id) = message.message_id.as_deref() {
            if self.failing_message_ids.contains(id) {
                return Err(AiError::ServiceUnavailable(format!(
                    "Mock classification failure for {id}"
                )));
            }
        }

        Ok(ClassificationResult {
            indexed_message_id: message.id,
            category: "general".to_string(),
            confidence: 0.9,
            draft: None,
        })
    }

    async fn run_incremental_learning(
        &self,
        user_id: Uuid,
        window: &LearningWindow,
        account_hint: Option<Uuid>,
    ) -> Result<LearningResult, AiError> {
        self.learning_calls.lock().await.push(LearningCall {
            user_id,
            window: *window,
            account_hint,
        });

        let result = self.learning_result.ok_or_else(|| {
            AiError::ServiceUnavailable("Mock learning configured to fail".to_string())
        })?;

        if let Some(store) = &self.pattern_store {
            for i in 0..self.patterns_per_run {
                store.insert_pattern(user_id, format!("mock pattern {i}")).await;
            }
        }

        Ok(result)
    }

    async fn health_check(&self) -> Result<bool, AiError> {
        Ok(true)
    }
}
