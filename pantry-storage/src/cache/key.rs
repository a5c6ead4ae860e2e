//! Cache key namespace.

use std::fmt;

use pantry_core::EntityId;
use uuid::Uuid;

const PREFIX: &str = "entity:";
const ALL: &str = "entity:all";

/// A key in the read cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// `entity:all`
    All,
    /// `entity:<id>`
    Entity(EntityId),
}

impl CacheKey {
    /// Encode the key in its textual form.
    pub fn encode(&self) -> String {
        match self {
            CacheKey::All => ALL.to_string(),
            CacheKey::Entity(id) => format!("{}{}", PREFIX, id),
        }
    }

    /// Parse a key from its textual form.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == ALL {
            return Some(CacheKey::All);
        }
        raw.strip_prefix(PREFIX)
            .and_then(|id| Uuid::parse_str(id).ok())
            .map(CacheKey::Entity)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::All => f.write_str(ALL),
            CacheKey::Entity(id) => write!(f, "{}{}", PREFIX, id),
        }
    }
}
