//! Account synchronization: cursor tracking, dedup and the orchestrator
//! that drives fetch, dedup, persist and cursor advance per account.

pub mod dedup;
pub mod locks;
pub mod orchestrator;
pub mod state;

use serde::{Deserialize, Serialize};

pub use dedup::{DedupEngine, DedupOutcome, ReconciliationPlan, ReconciliationReport};
pub use locks::{AccountGuard, AccountLocks};
pub use orchestrator::{AccountSyncOutcome, AccountSyncStatus, SyncOrchestrator, SyncReport};
pub use state::{AttemptOutcome, SyncStateTracker};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Accounts synced in parallel within one run.
    pub max_concurrent_accounts: usize,
    /// Width of a full-sync window.
    pub max_lookback_days: i64,
    /// Cursors older than this fall back to a full window.
    pub max_cursor_age_days: i64,
    /// Messages fetched per account per run, across pages.
    pub max_messages_per_run: usize,
    pub provider_timeout_seconds: u64,
    /// Accounts at or above this many consecutive failures are skipped
    /// until a forced sync. `None` disables the gate.
    pub max_consecutive_failures: Option<i32>,
    /// Lease on the store-level sync claim. Outlives any healthy run so a
    /// crashed holder only blocks the account until it expires.
    pub claim_lease_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_accounts: 8,
            max_lookback_days: 7,
            max_cursor_age_days: 7,
            max_messages_per_run: 500,
            provider_timeout_seconds: 60,
            max_consecutive_failures: None,
            claim_lease_seconds: 900,
        }
    }
}
