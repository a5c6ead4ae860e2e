//! Query Service
//!
//! Read-only view of the entity store, used by the read orchestrator on a
//! cache miss. [`StoreQueryService`] reads the store in-process; the gRPC
//! client in [`crate::grpc`] reaches a remote one.

use std::sync::Arc;

use async_trait::async_trait;
use pantry_core::{Entity, EntityId, PantryError, PantryResult};
use pantry_storage::EntityStore;

#[async_trait]
pub trait QueryService: Send + Sync {
    /// One entity, or `NotFound`.
    async fn get_one(&self, id: EntityId) -> PantryResult<Entity>;

    /// All entities in insertion order.
    async fn list_all(&self) -> PantryResult<Vec<Entity>>;
}

/// Query service backed directly by an entity store.
#[derive(Clone)]
pub struct StoreQueryService {
    store: Arc<dyn EntityStore>,
}

impl StoreQueryService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueryService for StoreQueryService {
    async fn get_one(&self, id: EntityId) -> PantryResult<Entity> {
        self.store.get(id).await?.ok_or(PantryError::NotFound { id })
    }

    async fn list_all(&self) -> PantryResult<Vec<Entity>> {
        self.store.list_all().await
    }
}
