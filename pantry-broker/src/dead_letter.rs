//! Dead-letter records: the terminal, operator-visible disposition of a
//! command that could not be applied.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use pantry_core::{Command, CommandId, PantryError, PantryResult, RoutingKey, StorageError, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a command was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The message body did not parse against the command schema.
    Serialization,
    /// The command's precondition never held within the retry budget.
    ApplyConflict,
    /// The store kept failing within the retry budget.
    Store,
}

/// One dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The command id when the body was readable, a fresh id otherwise.
    pub id: Uuid,
    pub routing_key: RoutingKey,
    /// The message body as received.
    pub body: Vec<u8>,
    /// The parsed command, absent for unreadable bodies.
    pub command: Option<Command>,
    pub reason: DeadLetterReason,
    pub error: String,
    pub attempts: u32,
    pub dead_lettered_at: Timestamp,
    pub replay_count: u32,
    pub last_replayed_at: Option<Timestamp>,
}

impl DeadLetterRecord {
    /// Record for a body that could not be parsed.
    pub fn unreadable(routing_key: RoutingKey, body: Vec<u8>, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            routing_key,
            body,
            command: None,
            reason: DeadLetterReason::Serialization,
            error: error.into(),
            attempts: 1,
            dead_lettered_at: Utc::now(),
            replay_count: 0,
            last_replayed_at: None,
        }
    }

    /// Record for a parsed command that exhausted its retries.
    pub fn exhausted(
        command: Command,
        body: Vec<u8>,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: command.command_id,
            routing_key: command.routing_key(),
            body,
            attempts: command.attempt,
            command: Some(command),
            reason,
            error: error.into(),
            dead_lettered_at: Utc::now(),
            replay_count: 0,
            last_replayed_at: None,
        }
    }

    pub fn command_id(&self) -> Option<CommandId> {
        self.command.as_ref().map(|command| command.command_id)
    }
}

/// Persistent list of dead-lettered commands.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Store a record. A record with the same id replaces the old one but
    /// keeps its replay history.
    async fn record(&self, record: DeadLetterRecord) -> PantryResult<()>;

    /// All records, oldest first.
    async fn list(&self) -> PantryResult<Vec<DeadLetterRecord>>;

    async fn get(&self, id: Uuid) -> PantryResult<Option<DeadLetterRecord>>;

    /// Bump the replay counter of a record. Fails with `NotFound` for an
    /// unknown id.
    async fn mark_replayed(&self, id: Uuid) -> PantryResult<DeadLetterRecord>;
}

/// Keep replay history when a replayed command dead-letters again.
pub(crate) fn merge_history(mut incoming: DeadLetterRecord, previous: Option<&DeadLetterRecord>) -> DeadLetterRecord {
    if let Some(previous) = previous {
        incoming.replay_count = previous.replay_count;
        incoming.last_replayed_at = previous.last_replayed_at;
    }
    incoming
}

/// In-memory dead-letter store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterStore {
    records: Arc<RwLock<Vec<DeadLetterRecord>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, record: DeadLetterRecord) -> PantryResult<()> {
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        match records.iter().position(|existing| existing.id == record.id) {
            Some(index) => {
                let merged = merge_history(record, records.get(index));
                records.remove(index);
                records.push(merged);
            }
            None => records.push(record),
        }
        Ok(())
    }

    async fn list(&self) -> PantryResult<Vec<DeadLetterRecord>> {
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(records.clone())
    }

    async fn get(&self, id: Uuid) -> PantryResult<Option<DeadLetterRecord>> {
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(records.iter().find(|record| record.id == id).cloned())
    }

    async fn mark_replayed(&self, id: Uuid) -> PantryResult<DeadLetterRecord> {
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(PantryError::NotFound { id })?;
        record.replay_count += 1;
        record.last_replayed_at = Some(Utc::now());
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::{new_entity_id, EntityFields};

    #[tokio::test]
    async fn test_record_list_replay() {
        let store = InMemoryDeadLetterStore::new();
        let command = Command::update(new_entity_id(), EntityFields::new("a", "b", 1), 1);
        let record = DeadLetterRecord::exhausted(
            command.clone(),
            b"{}".to_vec(),
            DeadLetterReason::ApplyConflict,
            "entity absent",
        );
        store.record(record).await.unwrap();
        store
            .record(DeadLetterRecord::unreadable(
                RoutingKey::EntityCreate,
                b"garbage".to_vec(),
                "expected value",
            ))
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, command.command_id);
        assert_eq!(listed[0].command_id(), Some(command.command_id));
        assert_eq!(listed[1].reason, DeadLetterReason::Serialization);
        assert_eq!(listed[1].command_id(), None);

        let replayed = store.mark_replayed(command.command_id).await.unwrap();
        assert_eq!(replayed.replay_count, 1);
        assert!(replayed.last_replayed_at.is_some());
    }

    #[tokio::test]
    async fn test_redead_letter_keeps_replay_count() {
        let store = InMemoryDeadLetterStore::new();
        let command = Command::update(new_entity_id(), EntityFields::new("a", "b", 1), 1);
        let first = DeadLetterRecord::exhausted(command.clone(), vec![], DeadLetterReason::ApplyConflict, "x");
        store.record(first).await.unwrap();
        store.mark_replayed(command.command_id).await.unwrap();

        let second = DeadLetterRecord::exhausted(command.clone(), vec![], DeadLetterReason::ApplyConflict, "y");
        store.record(second).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].replay_count, 1);
        assert_eq!(listed[0].error, "y");
    }

    #[tokio::test]
    async fn test_mark_replayed_unknown() {
        let store = InMemoryDeadLetterStore::new();
        let id = Uuid::now_v7();
        assert_eq!(store.mark_replayed(id).await.unwrap_err(), PantryError::NotFound { id });
    }
}
