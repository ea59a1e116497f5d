//! Message identity by provider message id.
//!
//! Incoming batches are split into new and redundant messages before they
//! reach the store. A separate reconciliation pass repairs duplicate rows
//! already persisted: within each `(account_id, message_id)` group the row
//! first seen by this system survives. Messages without an id are never
//! merged.

use crate::mail::{IncomingMessage, IndexedMessage, Result, SyncError};
use crate::storage::MailStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub new: Vec<IncomingMessage>,
    pub duplicates: Vec<IncomingMessage>,
}

/// Rows to keep and delete for one account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationPlan {
    pub survivors: Vec<IndexedMessage>,
    pub doomed: Vec<IndexedMessage>,
    pub unknown_bucket: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub account_id: Option<Uuid>,
    pub rows_scanned: usize,
    pub duplicate_groups: usize,
    pub rows_deleted: u64,
    pub unknown_bucket: usize,
    pub error: Option<String>,
}

pub struct DedupEngine {
    store: Arc<dyn MailStore>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn MailStore>) -> Self {
        Self { store }
    }

    /// Splits `incoming` against what is already indexed for the account.
    pub async fn reconcile(
        &self,
        account_id: Uuid,
        incoming: Vec<IncomingMessage>,
    ) -> Result<DedupOutcome> {
        let keys: Vec<String> = incoming
            .iter()
            .filter_map(|m| m.dedup_key().map(str::to_string))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let existing = self.store.existing_message_ids(account_id, &keys).await?;
        Ok(Self::partition(&existing, incoming))
    }

    /// The first occurrence of an id within a batch wins; later repeats and
    /// ids already in `existing` are duplicates.
    pub fn partition(existing: &HashSet<String>, incoming: Vec<IncomingMessage>) -> DedupOutcome {
        let mut seen: HashSet<String> = HashSet::new();
        let mut outcome = DedupOutcome::default();

        for message in incoming {
            match message.dedup_key() {
                None => outcome.new.push(message),
                Some(key) if existing.contains(key) || seen.contains(key) => {
                    outcome.duplicates.push(message)
                }
                Some(key) => {
                    seen.insert(key.to_string());
                    outcome.new.push(message);
                }
            }
        }

        outcome
    }

    /// Earliest `created_at` survives; ties go to the lowest row id.
    pub fn plan(rows: &[IndexedMessage]) -> Result<ReconciliationPlan> {
        let mut groups: BTreeMap<&str, Vec<&IndexedMessage>> = BTreeMap::new();
        let mut plan = ReconciliationPlan::default();

        for row in rows {
            match row.message_id.as_deref().filter(|k| !k.trim().is_empty()) {
                Some(key) => groups.entry(key).or_default().push(row),
                None => {
                    plan.unknown_bucket += 1;
                    plan.survivors.push(row.clone());
                }
            }
        }

        for (key, group) in groups {
            let winner = group
                .iter()
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
                .ok_or_else(|| SyncError::anomaly(format!("duplicate group {key} has no rows")))?;

            for row in &group {
                if row.id == winner.id {
                    plan.survivors.push((*row).clone());
                } else {
                    plan.doomed.push((*row).clone());
                }
            }
        }

        Ok(plan)
    }

    /// Full reconciliation pass over one account's indexed rows.
    #[instrument(skip(self))]
    pub async fn reconcile_existing(&self, account_id: Uuid) -> Result<ReconciliationReport> {
        let rows = self.store.list_indexed_messages(account_id).await?;
        let plan = Self::plan(&rows)?;

        let doomed_ids: Vec<Uuid> = plan.doomed.iter().map(|m| m.id).collect();
        let duplicate_groups = plan
            .doomed
            .iter()
            .filter_map(|m| m.message_id.as_deref())
            .collect::<HashSet<_>>()
            .len();

        let rows_deleted = if doomed_ids.is_empty() {
            0
        } else {
            self.store.delete_messages(&doomed_ids).await?
        };

        if rows_deleted > 0 {
            info!(
                %account_id,
                duplicate_groups,
                rows_deleted,
                "Removed duplicate indexed messages"
            );
        }

        Ok(ReconciliationReport {
            account_id: Some(account_id),
            rows_scanned: rows.len(),
            duplicate_groups,
            rows_deleted,
            unknown_bucket: plan.unknown_bucket,
            error: None,
        })
    }

    /// Runs the reconciliation pass for every account, isolating failures.
    pub async fn reconcile_all_accounts(&self) -> Result<Vec<ReconciliationReport>> {
        let accounts = self.store.list_accounts().await?;
        let mut reports = Vec::with_capacity(accounts.len());

        for account in accounts {
            match self.reconcile_existing(account.id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    if matches!(e, SyncError::DataIntegrityAnomaly { .. }) {
                        error!(account_id = %account.id, "Reconciliation anomaly: {}", e);
                    } else {
                        warn!(account_id = %account.id, "Reconciliation failed: {}", e);
                    }
                    reports.push(ReconciliationReport {
                        account_id: Some(account.id),
                        error: Some(e.to_string()),
                        ..Default::default()
                    });
                }
            }
        }

        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MessageType;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    fn row(message_id: Option<&str>, created_offset_secs: i64) -> IndexedMessage {
        let created = Utc::now() + Duration::seconds(created_offset_secs);
        IndexedMessage {
            id: Uuid::new_v4(),
            account_id: Uuid::nil(),
            message_id: message_id.map(str::to_string),
            folder: "INBOX".into(),
            message_type: MessageType::Inbox,
            received_at: created,
            created_at: created,
            content_cache_id: None,
        }
    }

    #[test]
    fn test_partition_against_existing_and_within_batch() {
        let existing: HashSet<String> = ["<a>".to_string()].into_iter().collect();
        let now = Utc::now();
        let incoming = vec![
            IncomingMessage::new("<a>", now),
            IncomingMessage::new("<b>", now),
            IncomingMessage::new("<b>", now),
            IncomingMessage::new("", now),
            IncomingMessage::new("", now),
        ];

        let outcome = DedupEngine::partition(&existing, incoming);
        assert_eq!(outcome.new.len(), 3);
        assert_eq!(outcome.duplicates.len(), 2);
    }

    #[test]
    fn test_plan_keeps_first_seen_row() {
        let early = row(Some("<x>"), -60);
        let late = row(Some("<x>"), 0);
        let plan = DedupEngine::plan(&[late.clone(), early.clone()]).unwrap();

        assert_eq!(plan.survivors, vec![early]);
        assert_eq!(plan.doomed, vec![late]);
    }

    #[test]
    fn test_unknown_bucket_is_never_merged() {
        let rows = vec![row(None, 0), row(None, 0), row(Some("  "), 0)];
        let plan = DedupEngine::plan(&rows).unwrap();
        assert_eq!(plan.survivors.len(), 3);
        assert!(plan.doomed.is_empty());
        assert_eq!(plan.unknown_bucket, 3);
    }

    fn arb_rows() -> impl Strategy<Value = Vec<IndexedMessage>> {
        prop::collection::vec(
            (prop::option::weighted(0.9, 0u8..6), -500i64..500),
            0..40,
        )
        .prop_map(|specs| {
            specs
                .into_iter()
                .map(|(id, offset)| row(id.map(|n| format!("<{n}@mail>")).as_deref(), offset))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_reconciliation_is_idempotent(rows in arb_rows()) {
            let once = DedupEngine::plan(&rows).unwrap();
            let twice = DedupEngine::plan(&once.survivors).unwrap();

            prop_assert!(twice.doomed.is_empty());
            let mut a: Vec<Uuid> = once.survivors.iter().map(|r| r.id).collect();
            let mut b: Vec<Uuid> = twice.survivors.iter().map(|r| r.id).collect();
            a.sort();
            b.sort();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_earliest_created_wins(rows in arb_rows()) {
            let plan = DedupEngine::plan(&rows).unwrap();
            for doomed in &plan.doomed {
                let survivor = plan
                    .survivors
                    .iter()
                    .find(|s| s.message_id == doomed.message_id)
                    .unwrap();
                prop_assert!(survivor.created_at <= doomed.created_at);
            }

            let keyed: HashSet<_> = rows.iter().filter_map(|r| r.message_id.clone()).collect();
            let surviving_keys = plan.survivors.iter().filter(|r| r.message_id.is_some()).count();
            prop_assert_eq!(keyed.len(), surviving_keys);
        }
    }
}
