//! Per-kind apply logic.
//!
//! A handler only decides what a command does to the store. Ordering,
//! retries and dead-lettering belong to the engine.

use async_trait::async_trait;
use pantry_core::{Command, Entity, PantryError, RoutingKey};
use pantry_storage::EntityStore;
use thiserror::Error;

/// Effect of a successfully handled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entity was written and now looks like this.
    Stored(Entity),
    /// The entity was removed. `existed` is false for a delete of an absent id.
    Removed { existed: bool },
    /// Nothing to do, e.g. a create for an id that already exists.
    Unchanged,
}

/// Why a command could not be applied on this attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// The store does not (yet) allow the command. Retryable.
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// The command itself is unusable. Never retried.
    #[error("malformed command: {0}")]
    Malformed(String),

    /// The store failed. Retryable.
    #[error(transparent)]
    Store(#[from] PantryError),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApplyError::Malformed(_))
    }
}

/// Applies one kind of command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Routing key whose commands this handler applies.
    fn routing_key(&self) -> RoutingKey;

    async fn apply(&self, command: &Command, store: &dyn EntityStore) -> Result<ApplyOutcome, ApplyError>;
}

fn entity_from(command: &Command) -> Result<Entity, ApplyError> {
    let fields = command
        .payload
        .clone()
        .ok_or_else(|| ApplyError::Malformed(format!("{} command without payload", command.kind)))?;
    Entity::new(command.entity_id, fields).map_err(|e| ApplyError::Malformed(e.to_string()))
}

/// Create: insert when absent, otherwise a no-op.
#[derive(Debug, Default)]
pub struct CreateHandler;

#[async_trait]
impl CommandHandler for CreateHandler {
    fn routing_key(&self) -> RoutingKey {
        RoutingKey::EntityCreate
    }

    async fn apply(&self, command: &Command, store: &dyn EntityStore) -> Result<ApplyOutcome, ApplyError> {
        let entity = entity_from(command)?;
        if store.get(command.entity_id).await?.is_some() {
            return Ok(ApplyOutcome::Unchanged);
        }
        store.put(&entity).await?;
        Ok(ApplyOutcome::Stored(entity))
    }
}

/// Update: overwrite when present, otherwise retry later.
#[derive(Debug, Default)]
pub struct UpdateHandler;

#[async_trait]
impl CommandHandler for UpdateHandler {
    fn routing_key(&self) -> RoutingKey {
        RoutingKey::EntityUpdate
    }

    async fn apply(&self, command: &Command, store: &dyn EntityStore) -> Result<ApplyOutcome, ApplyError> {
        let entity = entity_from(command)?;
        if store.get(command.entity_id).await?.is_none() {
            return Err(ApplyError::Precondition("entity absent".to_string()));
        }
        store.put(&entity).await?;
        Ok(ApplyOutcome::Stored(entity))
    }
}

/// Delete: unconditional and idempotent.
#[derive(Debug, Default)]
pub struct DeleteHandler;

#[async_trait]
impl CommandHandler for DeleteHandler {
    fn routing_key(&self) -> RoutingKey {
        RoutingKey::EntityDelete
    }

    async fn apply(&self, command: &Command, store: &dyn EntityStore) -> Result<ApplyOutcome, ApplyError> {
        let existed = store.delete(command.entity_id).await?;
        Ok(ApplyOutcome::Removed { existed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::{new_entity_id, EntityFields};
    use pantry_storage::InMemoryEntityStore;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryEntityStore::new();
        let id = new_entity_id();
        let command = Command::create(id, EntityFields::new("Soup", "water", 10), 1);

        let first = CreateHandler.apply(&command, &store).await.unwrap();
        assert!(matches!(first, ApplyOutcome::Stored(ref e) if e.id == id));
        let second = CreateHandler.apply(&command, &store).await.unwrap();
        assert_eq!(second, ApplyOutcome::Unchanged);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let store = InMemoryEntityStore::new();
        let id = new_entity_id();
        let update = Command::update(id, EntityFields::new("Stew", "beef", 90), 2);

        let err = UpdateHandler.apply(&update, &store).await.unwrap_err();
        assert!(matches!(err, ApplyError::Precondition(_)));
        assert!(err.is_retryable());

        CreateHandler
            .apply(&Command::create(id, EntityFields::new("Soup", "water", 10), 1), &store)
            .await
            .unwrap();
        UpdateHandler.apply(&update, &store).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().name, "Stew");
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let store = InMemoryEntityStore::new();
        let outcome = DeleteHandler
            .apply(&Command::delete(new_entity_id(), 1), &store)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Removed { existed: false });
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable() {
        let store = InMemoryEntityStore::new();
        store.set_fail_writes(true);
        let command = Command::create(new_entity_id(), EntityFields::new("Soup", "water", 10), 1);
        let err = CreateHandler.apply(&command, &store).await.unwrap_err();
        assert!(matches!(err, ApplyError::Store(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_payload_is_malformed() {
        let store = InMemoryEntityStore::new();
        let mut command = Command::update(new_entity_id(), EntityFields::new("a", "b", 1), 1);
        command.payload = None;
        let err = UpdateHandler.apply(&command, &store).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
