//! Cache payload shapes and their explicit mapping to and from [`Entity`].

use pantry_core::{Entity, EntityFields};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A cached value together with the watermark of its key at write time.
///
/// An entry whose stamp differs from the key's current watermark predates a
/// recorded change and reads as a miss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub watermark: u64,
    pub value: T,
}

/// Cached form of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub id: String,
    pub name: String,
    pub ingredients: String,
    pub duration: i64,
}

impl From<&Entity> for CachedEntity {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id.to_string(),
            name: entity.name.clone(),
            ingredients: entity.ingredients.clone(),
            duration: entity.duration,
        }
    }
}

impl TryFrom<CachedEntity> for Entity {
    type Error = String;

    fn try_from(cached: CachedEntity) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&cached.id).map_err(|e| format!("bad id: {}", e))?;
        let fields = EntityFields {
            name: cached.name,
            ingredients: cached.ingredients,
            duration: cached.duration,
        };
        Entity::new(id, fields).map_err(|e| e.to_string())
    }
}

/// Cached form of the full listing, in store order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedListing {
    pub entities: Vec<CachedEntity>,
}

impl From<&[Entity]> for CachedListing {
    fn from(entities: &[Entity]) -> Self {
        Self {
            entities: entities.iter().map(CachedEntity::from).collect(),
        }
    }
}

impl TryFrom<CachedListing> for Vec<Entity> {
    type Error = String;

    fn try_from(listing: CachedListing) -> Result<Self, Self::Error> {
        listing.entities.into_iter().map(Entity::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::new_entity_id;

    #[test]
    fn test_entity_mapping_is_field_for_field() {
        let entity = Entity::new(new_entity_id(), EntityFields::new("Soup", "water,salt", 10)).unwrap();
        let cached = CachedEntity::from(&entity);
        assert_eq!(cached.id, entity.id.to_string());
        assert_eq!(cached.name, "Soup");
        assert_eq!(cached.ingredients, "water,salt");
        assert_eq!(cached.duration, 10);
        assert_eq!(Entity::try_from(cached).unwrap(), entity);
    }

    #[test]
    fn test_invalid_cached_entity_rejected() {
        let cached = CachedEntity {
            id: "not-a-uuid".to_string(),
            name: "Soup".to_string(),
            ingredients: "water".to_string(),
            duration: 10,
        };
        assert!(Entity::try_from(cached).is_err());

        let cached = CachedEntity {
            id: new_entity_id().to_string(),
            name: "Soup".to_string(),
            ingredients: "water".to_string(),
            duration: 0,
        };
        assert!(Entity::try_from(cached).is_err());
    }
}
