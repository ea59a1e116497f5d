//! Per-account cursor bookkeeping.
//!
//! A sync run asks for its fetch window with [`SyncStateTracker::next_window`]
//! and reports the result back through [`SyncStateTracker::advance`]. Success
//! moves the cursor to the time the run *started*, so mail that arrives while
//! the run is in flight is picked up next time. Failure never touches
//! `last_sync_at`. A run stopped by the per-run cap clears the error but
//! leaves `last_sync_at` alone so the next run re-covers the same window.

use super::SyncConfig;
use crate::mail::{Result, SyncCursor};
use crate::providers::{FetchMode, FetchWindow};
use crate::storage::MailStore;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded { run_started_at: DateTime<Utc> },
    /// Persisted everything it kept but stopped before the window was exhausted.
    Truncated { attempted_at: DateTime<Utc> },
    Failed {
        attempted_at: DateTime<Utc>,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct SyncStateTracker {
    max_lookback: Duration,
    max_cursor_age: Duration,
}

impl SyncStateTracker {
    pub fn new(config: &SyncConfig) -> Self {
        let max_lookback = Duration::days(config.max_lookback_days.max(1));
        // A delta window never reaches further back than a full one.
        let max_cursor_age = Duration::days(config.max_cursor_age_days.max(1)).min(max_lookback);
        Self {
            max_lookback,
            max_cursor_age,
        }
    }

    pub fn max_lookback(&self) -> Duration {
        self.max_lookback
    }

    pub fn next_window(&self, cursor: Option<&SyncCursor>, now: DateTime<Utc>) -> FetchWindow {
        match cursor.and_then(|c| c.last_sync_at) {
            Some(last) if now - last < self.max_cursor_age => FetchWindow {
                mode: FetchMode::Delta,
                // Clock skew can leave a cursor in the future.
                since: last.min(now),
                until: now,
            },
            _ => FetchWindow {
                mode: FetchMode::Full,
                since: now - self.max_lookback,
                until: now,
            },
        }
    }

    pub fn advance(
        &self,
        account_id: Uuid,
        previous: Option<SyncCursor>,
        outcome: &AttemptOutcome,
    ) -> SyncCursor {
        let mut cursor = previous.unwrap_or_else(|| SyncCursor::empty(account_id));

        match outcome {
            AttemptOutcome::Succeeded { run_started_at } => {
                cursor.last_sync_at = Some(match cursor.last_sync_at {
                    Some(prev) => prev.max(*run_started_at),
                    None => *run_started_at,
                });
                cursor.sync_error = None;
                cursor.last_sync_attempt_at = Some(*run_started_at);
                cursor.consecutive_failures = 0;
            }
            AttemptOutcome::Truncated { attempted_at } => {
                cursor.sync_error = None;
                cursor.last_sync_attempt_at = Some(*attempted_at);
                cursor.consecutive_failures = 0;
            }
            AttemptOutcome::Failed {
                attempted_at,
                error,
            } => {
                cursor.sync_error = Some(error.clone());
                cursor.last_sync_attempt_at = Some(*attempted_at);
                cursor.consecutive_failures = cursor.consecutive_failures.saturating_add(1);
            }
        }

        cursor
    }

    /// Loads the stored cursor, applies `outcome` and writes it back.
    pub async fn record(
        &self,
        store: &dyn MailStore,
        account_id: Uuid,
        outcome: &AttemptOutcome,
    ) -> Result<SyncCursor> {
        let previous = store.get_sync_cursor(account_id).await?;
        let cursor = self.advance(account_id, previous, outcome);
        store.save_sync_cursor(&cursor).await?;
        debug!(
            %account_id,
            last_sync_at = ?cursor.last_sync_at,
            consecutive_failures = cursor.consecutive_failures,
            "Sync cursor updated"
        );
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker() -> SyncStateTracker {
        SyncStateTracker::new(&SyncConfig::default())
    }

    fn cursor_at(last: DateTime<Utc>) -> SyncCursor {
        SyncCursor {
            last_sync_at: Some(last),
            ..SyncCursor::empty(Uuid::new_v4())
        }
    }

    #[test]
    fn test_fresh_account_gets_bounded_full_window() {
        let now = Utc::now();
        let window = tracker().next_window(None, now);
        assert_eq!(window.mode, FetchMode::Full);
        assert_eq!(window.since, now - Duration::days(7));
        assert_eq!(window.until, now);
    }

    #[test]
    fn test_recent_cursor_gets_delta_window() {
        let now = Utc::now();
        let last = now - Duration::hours(2);
        let window = tracker().next_window(Some(&cursor_at(last)), now);
        assert_eq!(window.mode, FetchMode::Delta);
        assert_eq!(window.since, last);
    }

    #[test]
    fn test_stale_cursor_falls_back_to_full_window() {
        let now = Utc::now();
        let window = tracker().next_window(Some(&cursor_at(now - Duration::days(30))), now);
        assert_eq!(window.mode, FetchMode::Full);
        assert_eq!(window.since, now - Duration::days(7));
    }

    #[test]
    fn test_future_cursor_is_clamped() {
        let now = Utc::now();
        let window = tracker().next_window(Some(&cursor_at(now + Duration::hours(1))), now);
        assert_eq!(window.mode, FetchMode::Delta);
        assert_eq!(window.since, now);
    }

    #[test]
    fn test_failure_only_moves_error_fields() {
        let now = Utc::now();
        let previous = cursor_at(now - Duration::hours(1));
        let account_id = previous.account_id;

        let failed = tracker().advance(
            account_id,
            Some(previous.clone()),
            &AttemptOutcome::Failed {
                attempted_at: now,
                error: "rate limited".into(),
            },
        );

        assert_eq!(failed.last_sync_at, previous.last_sync_at);
        assert_eq!(failed.sync_error.as_deref(), Some("rate limited"));
        assert_eq!(failed.last_sync_attempt_at, Some(now));
        assert_eq!(failed.consecutive_failures, 1);

        let recovered = tracker().advance(
            account_id,
            Some(failed),
            &AttemptOutcome::Succeeded {
                run_started_at: now,
            },
        );
        assert_eq!(recovered.last_sync_at, Some(now));
        assert_eq!(recovered.sync_error, None);
        assert_eq!(recovered.consecutive_failures, 0);
    }

    #[test]
    fn test_cursor_age_is_clamped_to_lookback() {
        let tracker = SyncStateTracker::new(&SyncConfig {
            max_lookback_days: 7,
            max_cursor_age_days: 30,
            ..SyncConfig::default()
        });
        let now = Utc::now();

        let window = tracker.next_window(Some(&cursor_at(now - Duration::days(20))), now);
        assert_eq!(window.mode, FetchMode::Full);
        assert_eq!(window.since, now - Duration::days(7));
    }

    #[test]
    fn test_truncated_run_keeps_last_sync_at() {
        let now = Utc::now();
        let previous = SyncCursor {
            sync_error: Some("network reset".into()),
            consecutive_failures: 2,
            ..cursor_at(now - Duration::hours(3))
        };

        let cursor = tracker().advance(
            previous.account_id,
            Some(previous.clone()),
            &AttemptOutcome::Truncated { attempted_at: now },
        );

        assert_eq!(cursor.last_sync_at, previous.last_sync_at);
        assert_eq!(cursor.sync_error, None);
        assert_eq!(cursor.consecutive_failures, 0);
        assert_eq!(cursor.last_sync_attempt_at, Some(now));
    }

    proptest! {
        #[test]
        fn prop_cursor_is_monotonic(steps in prop::collection::vec((any::<bool>(), -3_600i64..86_400), 1..40)) {
            let tracker = tracker();
            let account_id = Uuid::new_v4();
            let base = Utc::now();
            let mut cursor: Option<SyncCursor> = None;

            for (succeeded, offset) in steps {
                let at = base + Duration::seconds(offset);
                let before = cursor.as_ref().and_then(|c| c.last_sync_at);
                let outcome = if succeeded {
                    AttemptOutcome::Succeeded { run_started_at: at }
                } else {
                    AttemptOutcome::Failed { attempted_at: at, error: "boom".into() }
                };
                let next = tracker.advance(account_id, cursor.take(), &outcome);

                if succeeded {
                    prop_assert!(next.last_sync_at >= before);
                } else {
                    prop_assert_eq!(next.last_sync_at, before);
                }
                cursor = Some(next);
            }
        }

        #[test]
        fn prop_full_window_never_exceeds_lookback(days_old in 0i64..3650) {
            let tracker = tracker();
            let now = Utc::now();
            let cursor = cursor_at(now - Duration::days(days_old));
            for window in [tracker.next_window(None, now), tracker.next_window(Some(&cursor), now)] {
                prop_assert!(window.until - window.since <= tracker.max_lookback());
            }
        }
    }
}
