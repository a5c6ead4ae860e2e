//! In-memory entity store and apply ledger.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use pantry_core::{Entity, EntityId, PantryError, PantryResult, StorageError};

use crate::{ApplyLedger, EntityStore};

#[derive(Debug, Default)]
struct StoreInner {
    /// id -> (insertion sequence, entity)
    entities: HashMap<EntityId, (u64, Entity)>,
    /// insertion sequence -> id
    order: BTreeMap<u64, EntityId>,
    next_insert: u64,
}

/// In-memory entity store.
///
/// Writes can be made to fail with [`InMemoryEntityStore::set_fail_writes`]
/// to exercise the processor's retry path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEntityStore {
    inner: Arc<RwLock<StoreInner>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.entities.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every subsequent `put`/`delete` fail with a `StoreError`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> PantryResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::TransactionFailed {
                reason: "store rejected write".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, id: EntityId) -> PantryResult<Option<Entity>> {
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner.entities.get(&id).map(|(_, entity)| entity.clone()))
    }

    async fn put(&self, entity: &Entity) -> PantryResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        let position = match inner.entities.get(&entity.id) {
            Some((position, _)) => *position,
            None => {
                let position = inner.next_insert;
                inner.next_insert += 1;
                inner.order.insert(position, entity.id);
                position
            }
        };
        inner.entities.insert(entity.id, (position, entity.clone()));
        Ok(())
    }

    async fn delete(&self, id: EntityId) -> PantryResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        match inner.entities.remove(&id) {
            Some((position, _)) => {
                inner.order.remove(&position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_all(&self) -> PantryResult<Vec<Entity>> {
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        inner
            .order
            .values()
            .map(|id| {
                inner
                    .entities
                    .get(id)
                    .map(|(_, entity)| entity.clone())
                    .ok_or_else(|| {
                        PantryError::from(StorageError::CorruptRecord {
                            id: *id,
                            reason: "ordering index points at a missing entity".to_string(),
                        })
                    })
            })
            .collect()
    }
}

/// In-memory apply ledger.
#[derive(Debug, Clone, Default)]
pub struct InMemoryApplyLedger {
    applied: Arc<RwLock<HashMap<EntityId, u64>>>,
}

impl InMemoryApplyLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApplyLedger for InMemoryApplyLedger {
    async fn last_applied(&self, id: EntityId) -> PantryResult<Option<u64>> {
        let applied = self.applied.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(applied.get(&id).copied())
    }

    async fn record_applied(&self, id: EntityId, sequence: u64) -> PantryResult<()> {
        let mut applied = self.applied.write().map_err(|_| StorageError::LockPoisoned)?;
        let slot = applied.entry(id).or_insert(sequence);
        *slot = (*slot).max(sequence);
        Ok(())
    }

    async fn high_water_mark(&self) -> PantryResult<u64> {
        let applied = self.applied.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(applied.values().copied().max().unwrap_or(0))
    }
}
