//! REST request and response types.
//!
//! Every conversion to and from the domain types is written out field by
//! field; nothing here is shared with the wire, cache or proto formats.

use chrono::{DateTime, Utc};
use pantry_broker::{DeadLetterReason, DeadLetterRecord};
use pantry_core::{Entity, EntityFields, EntityId, ValidationError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::publisher::Acceptance;

// ============================================================================
// REQUESTS
// ============================================================================

/// Body of `POST /entities`. Omit `id` to have one generated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CreateEntityRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ingredients: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
}

/// Body of `PUT /entities/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UpdateEntityRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ingredients: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
}

/// Collect request fields, reporting the first one that is absent.
///
/// Content checks (blank strings, non-positive duration) happen in the
/// publisher.
pub fn request_fields(
    name: Option<String>,
    ingredients: Option<String>,
    duration: Option<i64>,
) -> Result<EntityFields, ValidationError> {
    let missing = |field: &str| ValidationError::RequiredFieldMissing {
        field: field.to_string(),
    };
    Ok(EntityFields {
        name: name.ok_or_else(|| missing("name"))?,
        ingredients: ingredients.ok_or_else(|| missing("ingredients"))?,
        duration: duration.ok_or_else(|| missing("duration"))?,
    })
}

impl CreateEntityRequest {
    pub fn into_parts(self) -> Result<(Option<EntityId>, EntityFields), ValidationError> {
        let id = self
            .id
            .as_deref()
            .map(pantry_core::parse_entity_id)
            .transpose()?;
        let fields = request_fields(self.name, self.ingredients, self.duration)?;
        Ok((id, fields))
    }
}

impl UpdateEntityRequest {
    pub fn into_fields(self) -> Result<EntityFields, ValidationError> {
        request_fields(self.name, self.ingredients, self.duration)
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

/// An entity as returned by the read endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EntityResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub id: Uuid,
    pub name: String,
    pub ingredients: String,
    pub duration: i64,
}

impl From<Entity> for EntityResponse {
    fn from(entity: Entity) -> Self {
        Self {
            id: entity.id,
            name: entity.name,
            ingredients: entity.ingredients,
            duration: entity.duration,
        }
    }
}

/// Returned with `202 Accepted` for every mutation. Acceptance is not
/// completion: the command has been queued, not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub command_id: Uuid,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub entity_id: Uuid,
    pub routing_key: String,
    pub status: String,
}

impl From<Acceptance> for AcceptedResponse {
    fn from(acceptance: Acceptance) -> Self {
        Self {
            command_id: acceptance.command_id,
            entity_id: acceptance.entity_id,
            routing_key: acceptance.routing_key.as_str().to_string(),
            status: "accepted".to_string(),
        }
    }
}

/// A dead-lettered command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub id: Uuid,
    pub routing_key: String,
    /// `serialization`, `apply_conflict` or `store`
    pub reason: String,
    pub error: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub entity_id: Option<Uuid>,
    /// The message body as received, lossily decoded as UTF-8.
    pub body: String,
    /// Whether the record can be replayed.
    pub replayable: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub dead_lettered_at: DateTime<Utc>,
    pub replay_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub last_replayed_at: Option<DateTime<Utc>>,
}

fn reason_label(reason: DeadLetterReason) -> &'static str {
    match reason {
        DeadLetterReason::Serialization => "serialization",
        DeadLetterReason::ApplyConflict => "apply_conflict",
        DeadLetterReason::Store => "store",
    }
}

impl From<DeadLetterRecord> for DeadLetterResponse {
    fn from(record: DeadLetterRecord) -> Self {
        Self {
            id: record.id,
            routing_key: record.routing_key.as_str().to_string(),
            reason: reason_label(record.reason).to_string(),
            error: record.error,
            attempts: record.attempts,
            entity_id: record.command.as_ref().map(|command| command.entity_id),
            body: String::from_utf8_lossy(&record.body).into_owned(),
            replayable: record.command.is_some(),
            dead_lettered_at: record.dead_lettered_at,
            replay_count: record.replay_count,
            last_replayed_at: record.last_replayed_at,
        }
    }
}

/// `GET /dead-letters` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ListDeadLettersResponse {
    pub records: Vec<DeadLetterResponse>,
    pub total: usize,
}
