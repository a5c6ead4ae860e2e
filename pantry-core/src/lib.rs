//! PANTRY Core - Entity and Command Types
//!
//! Pure data structures shared by every other crate: the catalog entity,
//! the command envelope that travels through the broker, the apply-side
//! state machine vocabulary, retry policy, and the error taxonomy.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod command;
pub mod entity;
pub mod error;
pub mod retry;

pub use command::{Command, CommandKind, CommandState, RoutingKey};
pub use entity::{Entity, EntityFields};
pub use error::{
    ApplyConflictError, BrokerError, CacheError, PantryError, PantryResult, StorageError,
    ValidationError,
};
pub use retry::RetryConfig;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier. Client-supplied ids are accepted as-is; generated ids
/// are UUIDv7 so they sort by creation time.
pub type EntityId = Uuid;

/// Identifier of a single command publication, stable across redeliveries.
pub type CommandId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Generate a new CommandId.
pub fn new_command_id() -> CommandId {
    Uuid::now_v7()
}

/// Parse an entity id from its textual form.
pub fn parse_entity_id(raw: &str) -> Result<EntityId, ValidationError> {
    Uuid::parse_str(raw.trim()).map_err(|e| ValidationError::InvalidValue {
        field: "id".to_string(),
        reason: e.to_string(),
    })
}
