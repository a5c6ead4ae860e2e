//! The catalog entity and its mutable fields.

use serde::{Deserialize, Serialize};

use crate::{EntityId, ValidationError};

/// The mutable part of an entity, as carried by Create and Update commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EntityFields {
    pub name: String,
    pub ingredients: String,
    /// Duration in minutes. Always strictly positive once validated.
    pub duration: i64,
}

impl EntityFields {
    pub fn new(name: impl Into<String>, ingredients: impl Into<String>, duration: i64) -> Self {
        Self {
            name: name.into(),
            ingredients: ingredients.into(),
            duration,
        }
    }

    /// Check the field invariants: non-empty name, non-empty ingredients,
    /// positive duration. Whitespace-only text counts as empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "name".to_string(),
            });
        }
        if self.ingredients.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "ingredients".to_string(),
            });
        }
        if self.duration <= 0 {
            return Err(ValidationError::InvalidValue {
                field: "duration".to_string(),
                reason: format!("must be greater than zero, got {}", self.duration),
            });
        }
        Ok(())
    }
}

/// A catalog record. Only the command processor creates, mutates or removes
/// entities; everything else sees copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Entity {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub id: EntityId,
    pub name: String,
    pub ingredients: String,
    pub duration: i64,
}

impl Entity {
    /// Build an entity from validated fields.
    pub fn new(id: EntityId, fields: EntityFields) -> Result<Self, ValidationError> {
        fields.validate()?;
        Ok(Self {
            id,
            name: fields.name,
            ingredients: fields.ingredients,
            duration: fields.duration,
        })
    }

    /// Copy out the mutable fields.
    pub fn fields(&self) -> EntityFields {
        EntityFields {
            name: self.name.clone(),
            ingredients: self.ingredients.clone(),
            duration: self.duration,
        }
    }
}
