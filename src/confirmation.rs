//! Confirmation Manager (§4.6): an in-memory, time-bounded map of pending
//! destructive-action requests, keyed by (requesting user, action kind,
//! target session). Used by destructive commands (kill, restart) and
//! anything else that needs a second tap.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfirmationKey {
    pub user: String,
    pub action: String,
    pub target_session: String,
}

struct Pending {
    created_at: Instant,
    ttl: Duration,
}

/// All access is serialized through this manager's own methods (§5 "Shared
/// resources") — no caller ever sees the map directly.
pub struct ConfirmationManager {
    pending: Mutex<HashMap<ConfirmationKey, Pending>>,
}

impl Default for ConfirmationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationManager {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a pending confirmation, replacing any existing entry with the
    /// same key.
    pub async fn request(&self, key: ConfirmationKey, ttl: Duration) {
        let mut pending = self.pending.lock().await;
        pending.insert(
            key,
            Pending {
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Returns `true` iff an unexpired entry exists for `key`, removing it
    /// on success. A second call for the same key after a success — or
    /// after expiry — returns `false` (§8).
    pub async fn confirm(&self, key: &ConfirmationKey) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.get(key) {
            Some(p) if p.created_at.elapsed() <= p.ttl => {
                pending.remove(key);
                true
            }
            Some(_) => {
                pending.remove(key);
                false
            }
            None => false,
        }
    }

    /// Remove a pending confirmation unconditionally.
    pub async fn cancel(&self, key: &ConfirmationKey) {
        self.pending.lock().await.remove(key);
    }

    /// Sweep expired entries. Intended to be called periodically from a
    /// dedicated task (§5 "one task ... for the confirmation sweeper").
    pub async fn sweep_expired(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| p.created_at.elapsed() <= p.ttl);
        before - pending.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Run the periodic sweeper until `shutdown` fires.
pub async fn run_sweeper(manager: std::sync::Arc<ConfirmationManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        manager.sweep_expired().await;
    }
}
