//! Per-conversation serialization of turns.
//!
//! Turns of the same conversation run one at a time; turns of different
//! conversations never wait on each other. Entries are removed once the
//! last holder or waiter is gone, so the map only holds active
//! conversations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use propmatch_core::ConversationId;

type LockMap = HashMap<ConversationId, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. Access is released when the
    /// returned guard is dropped.
    pub async fn acquire(&self, id: &ConversationId) -> ConversationGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(id.clone()).or_default().clone()
        };
        // Built before waiting so a cancelled wait still prunes the entry.
        // `acquiring` is declared later and is dropped first, releasing its Arc.
        let mut pending = ConversationGuard {
            guard: None,
            id: id.clone(),
            locks: self.inner.clone(),
        };
        let acquiring = lock.lock_owned();
        pending.guard = Some(acquiring.await);
        pending
    }

    /// Number of conversations currently held or awaited.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one conversation. Holds no access while `guard` is
/// `None`, which only happens inside a pending `acquire`.
pub struct ConversationGuard {
    guard: Option<OwnedMutexGuard<()>>,
    id: ConversationId,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        // Release the mutex first so its Arc count reflects only the map
        // entry and any waiters.
        self.guard.take();
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = map.get(&self.id) {
            if Arc::strong_count(lock) == 1 {
                map.remove(&self.id);
            }
        }
    }
}
