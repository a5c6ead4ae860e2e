//! PANTRY Storage
//!
//! The canonical entity store, the per-id apply ledger used by the command
//! processor for ordering, and the read cache that sits in front of the
//! query service. Each concern has an in-memory implementation for tests and
//! single-process runs, and an LMDB (heed) implementation for durability.

use async_trait::async_trait;
use pantry_core::{Entity, EntityId, PantryResult};

pub mod cache;
pub mod lmdb;
pub mod memory;

pub use lmdb::{LmdbApplyLedger, LmdbEntityStore, LmdbStoreError};
pub use memory::{InMemoryApplyLedger, InMemoryEntityStore};

// ============================================================================
// ENTITY STORE
// ============================================================================

/// The source of truth for entities.
///
/// Only the command processor writes through this interface. Writes for a
/// given id are serialized by the processor, so implementations only need to
/// be internally consistent, not ordered.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch one entity. `None` means the id is not present.
    async fn get(&self, id: EntityId) -> PantryResult<Option<Entity>>;

    /// Insert or replace an entity. Replacing keeps the original insertion
    /// position.
    async fn put(&self, entity: &Entity) -> PantryResult<()>;

    /// Remove an entity. Removing an absent id succeeds and returns `false`.
    async fn delete(&self, id: EntityId) -> PantryResult<bool>;

    /// All entities, ordered by first insertion.
    async fn list_all(&self) -> PantryResult<Vec<Entity>>;
}

// ============================================================================
// APPLY LEDGER
// ============================================================================

/// Highest applied command sequence per entity id.
///
/// Entries outlive the entity itself, so a delete leaves a tombstone that
/// rejects stale creates and updates submitted before it.
#[async_trait]
pub trait ApplyLedger: Send + Sync {
    /// The sequence of the last command applied to `id`, if any.
    async fn last_applied(&self, id: EntityId) -> PantryResult<Option<u64>>;

    /// Record that `sequence` was applied to `id`. Never lowers the stored value.
    async fn record_applied(&self, id: EntityId, sequence: u64) -> PantryResult<()>;

    /// The highest sequence recorded for any id, 0 when empty.
    async fn high_water_mark(&self) -> PantryResult<u64>;
}
