//! Command Publisher
//!
//! Turns a client mutation intent into a [`Command`] on the broker. Field
//! validation is the only synchronous guarantee: once `submit` returns, the
//! command is durably queued, not applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use pantry_broker::{encode_command, Broker};
use pantry_core::{
    new_entity_id, Command, CommandId, CommandKind, EntityFields, EntityId, PantryError,
    PantryResult, RoutingKey, ValidationError,
};
use pantry_storage::cache::{CacheKey, ReadCache};
use pantry_storage::ApplyLedger;
use tokio::sync::OnceCell;

/// Acknowledgement of a queued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub command_id: CommandId,
    pub entity_id: EntityId,
    pub routing_key: RoutingKey,
    pub sequence: u64,
}

/// Monotonic submission sequence.
///
/// Values are microseconds since the epoch, bumped past the previous value on
/// collision. [`SequenceClock::advance_past`] sets a floor, so a clock that
/// was stepped back across a restart still issues values above everything
/// already applied.
#[derive(Debug, Default)]
pub struct SequenceClock {
    last: AtomicU64,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev.saturating_add(1)))
            })
            .unwrap_or_else(|prev| prev);
        now.max(previous.saturating_add(1))
    }

    /// Never issue `floor` or anything below it from now on.
    pub fn advance_past(&self, floor: u64) {
        self.last.fetch_max(floor, Ordering::SeqCst);
    }
}

/// Validates, sequences and publishes commands.
pub struct CommandPublisher {
    broker: Arc<dyn Broker>,
    cache: ReadCache,
    ledger: Arc<dyn ApplyLedger>,
    clock: SequenceClock,
    seeded: OnceCell<()>,
}

impl CommandPublisher {
    pub fn new(broker: Arc<dyn Broker>, cache: ReadCache, ledger: Arc<dyn ApplyLedger>) -> Self {
        Self {
            broker,
            cache,
            ledger,
            clock: SequenceClock::new(),
            seeded: OnceCell::new(),
        }
    }

    /// Next submission sequence. The first call raises the clock above the
    /// ledger's high-water mark.
    async fn next_sequence(&self) -> PantryResult<u64> {
        self.seeded
            .get_or_try_init(|| async {
                let floor = self.ledger.high_water_mark().await?;
                self.clock.advance_past(floor);
                tracing::debug!(floor, "Sequence clock seeded from apply ledger");
                Ok::<(), PantryError>(())
            })
            .await?;
        Ok(self.clock.next())
    }

    /// Submit a mutation.
    ///
    /// `Create` generates an id when none is given. `Update` and `Delete`
    /// need one. `Delete` takes no fields; the others require valid fields.
    pub async fn submit(
        &self,
        kind: CommandKind,
        entity_id: Option<EntityId>,
        fields: Option<EntityFields>,
    ) -> PantryResult<Acceptance> {
        let entity_id = match (kind, entity_id) {
            (_, Some(id)) => id,
            (CommandKind::Create, None) => new_entity_id(),
            (_, None) => {
                return Err(ValidationError::RequiredFieldMissing {
                    field: "id".to_string(),
                }
                .into())
            }
        };

        let payload = match (kind.requires_payload(), fields) {
            (true, Some(fields)) => Some(normalize(fields)?),
            (true, None) => {
                return Err(ValidationError::RequiredFieldMissing {
                    field: "payload".to_string(),
                }
                .into())
            }
            (false, Some(_)) => {
                return Err(ValidationError::InvalidValue {
                    field: "payload".to_string(),
                    reason: format!("{} carries no fields", kind),
                }
                .into())
            }
            (false, None) => None,
        };

        let sequence = self.next_sequence().await?;
        let command = match (kind, payload) {
            (CommandKind::Create, Some(fields)) => Command::create(entity_id, fields, sequence),
            (CommandKind::Update, Some(fields)) => Command::update(entity_id, fields, sequence),
            _ => Command::delete(entity_id, sequence),
        };

        self.publish(&command).await?;

        Ok(Acceptance {
            command_id: command.command_id,
            entity_id,
            routing_key: command.routing_key(),
            sequence,
        })
    }

    pub async fn create(&self, entity_id: Option<EntityId>, fields: EntityFields) -> PantryResult<Acceptance> {
        self.submit(CommandKind::Create, entity_id, Some(fields)).await
    }

    pub async fn update(&self, entity_id: EntityId, fields: EntityFields) -> PantryResult<Acceptance> {
        self.submit(CommandKind::Update, Some(entity_id), Some(fields)).await
    }

    pub async fn delete(&self, entity_id: EntityId) -> PantryResult<Acceptance> {
        self.submit(CommandKind::Delete, Some(entity_id), None).await
    }

    /// Publish a previously dead-lettered command again, from attempt 1.
    ///
    /// The command keeps its id and sequence, so a replay that a newer
    /// command has overtaken is skipped by the processor.
    pub async fn republish(&self, command: &Command) -> PantryResult<Acceptance> {
        let command = command.replayed();
        self.publish(&command).await?;
        Ok(Acceptance {
            command_id: command.command_id,
            entity_id: command.entity_id,
            routing_key: command.routing_key(),
            sequence: command.sequence,
        })
    }

    async fn publish(&self, command: &Command) -> PantryResult<()> {
        let body = encode_command(command)?;
        self.broker.publish(command.routing_key(), body).await?;

        tracing::debug!(
            command_id = %command.command_id,
            entity_id = %command.entity_id,
            routing_key = %command.routing_key(),
            sequence = command.sequence,
            "Command published"
        );

        // The listing is stale from now on, whatever the apply outcome.
        if let Err(e) = self.cache.invalidate(&CacheKey::All).await {
            tracing::warn!(error = %e, "Failed to evict entity listing after submission");
        }
        Ok(())
    }
}

/// Trim whitespace and check the entity invariants.
fn normalize(fields: EntityFields) -> Result<EntityFields, ValidationError> {
    let fields = EntityFields {
        name: fields.name.trim().to_string(),
        ingredients: fields.ingredients.trim().to_string(),
        duration: fields.duration,
    };
    fields.validate()?;
    Ok(fields)
}
