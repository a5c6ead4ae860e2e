//! Commands: durable, asynchronous requests to mutate one entity.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{new_command_id, CommandId, EntityFields, EntityId, Timestamp};

// ============================================================================
// COMMAND KIND AND ROUTING
// ============================================================================

/// The three mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Create,
    Update,
    Delete,
}

impl CommandKind {
    pub const ALL: [CommandKind; 3] = [CommandKind::Create, CommandKind::Update, CommandKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Create => "create",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete",
        }
    }

    /// Each kind is published under its own routing key.
    pub fn routing_key(&self) -> RoutingKey {
        match self {
            CommandKind::Create => RoutingKey::EntityCreate,
            CommandKind::Update => RoutingKey::EntityUpdate,
            CommandKind::Delete => RoutingKey::EntityDelete,
        }
    }

    /// Whether commands of this kind must carry entity fields.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, CommandKind::Delete)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(CommandKind::Create),
            "update" => Ok(CommandKind::Update),
            "delete" => Ok(CommandKind::Delete),
            other => Err(format!("unknown command kind: {}", other)),
        }
    }
}

/// Routing keys on the entity exchange, one per command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum RoutingKey {
    #[serde(rename = "entity.create")]
    EntityCreate,
    #[serde(rename = "entity.update")]
    EntityUpdate,
    #[serde(rename = "entity.delete")]
    EntityDelete,
}

impl RoutingKey {
    pub const ALL: [RoutingKey; 3] = [
        RoutingKey::EntityCreate,
        RoutingKey::EntityUpdate,
        RoutingKey::EntityDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingKey::EntityCreate => "entity.create",
            RoutingKey::EntityUpdate => "entity.update",
            RoutingKey::EntityDelete => "entity.delete",
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            RoutingKey::EntityCreate => CommandKind::Create,
            RoutingKey::EntityUpdate => CommandKind::Update,
            RoutingKey::EntityDelete => CommandKind::Delete,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoutingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| format!("unknown routing key: {}", s))
    }
}

// ============================================================================
// COMMAND
// ============================================================================

/// A command as published to the broker. Immutable once published; a retry
/// is a new publication of the same command with `attempt + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Command {
    /// Stable across redeliveries and retries.
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub command_id: CommandId,
    pub kind: CommandKind,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub entity_id: EntityId,
    /// Present for Create and Update, absent for Delete.
    pub payload: Option<EntityFields>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub submitted_at: Timestamp,
    /// Publisher-assigned submission order. Larger means submitted later.
    pub sequence: u64,
    /// 1 on first publication.
    pub attempt: u32,
}

impl Command {
    fn build(kind: CommandKind, entity_id: EntityId, payload: Option<EntityFields>, sequence: u64) -> Self {
        Self {
            command_id: new_command_id(),
            kind,
            entity_id,
            payload,
            submitted_at: Utc::now(),
            sequence,
            attempt: 1,
        }
    }

    pub fn create(entity_id: EntityId, fields: EntityFields, sequence: u64) -> Self {
        Self::build(CommandKind::Create, entity_id, Some(fields), sequence)
    }

    pub fn update(entity_id: EntityId, fields: EntityFields, sequence: u64) -> Self {
        Self::build(CommandKind::Update, entity_id, Some(fields), sequence)
    }

    pub fn delete(entity_id: EntityId, sequence: u64) -> Self {
        Self::build(CommandKind::Delete, entity_id, None, sequence)
    }

    pub fn routing_key(&self) -> RoutingKey {
        self.kind.routing_key()
    }

    /// The same command, scheduled for another attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// The same command, reset for an operator replay.
    pub fn replayed(&self) -> Self {
        Self {
            attempt: 1,
            ..self.clone()
        }
    }
}

// ============================================================================
// APPLY-SIDE STATE MACHINE
// ============================================================================

/// States a command passes through on the apply side.
///
/// `Received -> Validating -> Applied`, or
/// `Received -> Validating -> Retrying -> ... -> DeadLettered`.
/// A malformed payload goes straight from `Received` to `DeadLettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Received,
    Validating,
    Applied,
    Retrying,
    DeadLettered,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Applied | CommandState::DeadLettered)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Received, DeadLettered)
                | (Validating, Applied)
                | (Validating, Retrying)
                | (Validating, DeadLettered)
                | (Retrying, Validating)
                | (Retrying, DeadLettered)
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandState::Received => "received",
            CommandState::Validating => "validating",
            CommandState::Applied => "applied",
            CommandState::Retrying => "retrying",
            CommandState::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}
