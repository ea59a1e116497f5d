use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// In-progress flags for accounts currently being synced. Shared by
/// scheduled and manual runs so the same account never syncs twice at once.
#[derive(Debug, Clone, Default)]
pub struct AccountLocks {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

/// Releases the account when dropped.
#[derive(Debug)]
pub struct AccountGuard {
    account_id: Uuid,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when the account is already held.
    pub fn try_acquire(&self, account_id: Uuid) -> Option<AccountGuard> {
        if !lock(&self.in_flight).insert(account_id) {
            return None;
        }
        Some(AccountGuard {
            account_id,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_locked(&self, account_id: Uuid) -> bool {
        lock(&self.in_flight).contains(&account_id)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

impl AccountGuard {
    pub fn account_id(&self) -> Uuid {
        self.account_id
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.account_id);
    }
}

// The set stays consistent even if a holder panicked, so poisoning is ignored.
fn lock(set: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
