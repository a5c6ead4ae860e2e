//! Per-entity mutual exclusion.
//!
//! At most one command per entity id is validated and applied at a time,
//! across all queues and workers. Lock entries are dropped once nobody
//! holds or waits for them.

use std::sync::Arc;

use dashmap::DashMap;
use pantry_core::EntityId;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
pub struct KeySequencer {
    locks: Arc<DashMap<EntityId, Arc<Mutex<()>>>>,
}

/// Held while a command for `id` is being applied.
#[derive(Debug)]
pub struct KeyGuard {
    id: EntityId,
    locks: Arc<DashMap<EntityId, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: EntityId) -> KeyGuard {
        let mutex = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            id,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of ids with a live lock entry.
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // The map and this guard's mutex are the only references when nobody waits.
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) <= 2);
        self.guard.take();
    }
}
