//! Per-conversation turn serialization.
//!
//! Only one turn may run per conversation at a time. A second turn for the
//! same conversation waits until the first has persisted its final state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use deepsearch_core::message::ConversationId;

/// Held for the duration of a turn; releases on drop.
pub type ConversationGuard = OwnedMutexGuard<()>;

/// Manages per-conversation run locks.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: &ConversationId) -> ConversationGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(id.as_str().to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of tracked conversations.
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }

    /// Forget locks that nobody holds or waits on.
    pub fn prune_idle(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
