//! Typed read cache over a [`CacheBackend`] and a [`ChangeJournal`].

use std::sync::Arc;
use std::time::Duration;

use pantry_core::{CacheError, Entity, EntityId};

use super::journal::{ChangeJournal, Watermark};
use super::key::CacheKey;
use super::payload::{CachedEntity, CachedListing, Stamped};
use super::traits::{CacheBackend, CacheStats};

/// Result of populating the cache after a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// The value is now cached.
    Stored,
    /// A change was recorded for the key while the value was in flight;
    /// the entry was evicted again.
    Discarded,
}

/// The entity read cache.
///
/// Readers use `get_*` and `populate_*`. The publisher uses
/// [`ReadCache::invalidate`] for the listing key. The processor calls
/// [`ReadCache::entity_applied`] once a mutation is committed.
#[derive(Clone)]
pub struct ReadCache {
    backend: Arc<dyn CacheBackend>,
    journal: Arc<dyn ChangeJournal>,
    ttl: Duration,
}

impl ReadCache {
    pub fn new(backend: Arc<dyn CacheBackend>, journal: Arc<dyn ChangeJournal>, ttl: Duration) -> Self {
        Self {
            backend,
            journal,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached entity, if any.
    ///
    /// An unreadable entry is evicted and reported as `CorruptEntry`, which
    /// callers treat like any other cache failure. An entry written before
    /// the latest recorded change of its key reads as a miss.
    pub async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, CacheError> {
        let key = CacheKey::Entity(id);
        let Some(cached) = self.get_current::<CachedEntity>(&key).await? else {
            return Ok(None);
        };
        match Entity::try_from(cached) {
            Ok(entity) if entity.id == id => Ok(Some(entity)),
            Ok(entity) => self.corrupt(&key, format!("entry holds id {}", entity.id)).await,
            Err(reason) => self.corrupt(&key, reason).await,
        }
    }

    /// Cached full listing, if any.
    pub async fn get_listing(&self) -> Result<Option<Vec<Entity>>, CacheError> {
        let key = CacheKey::All;
        let Some(listing) = self.get_current::<CachedListing>(&key).await? else {
            return Ok(None);
        };
        match Vec::<Entity>::try_from(listing) {
            Ok(entities) => Ok(Some(entities)),
            Err(reason) => self.corrupt(&key, reason).await,
        }
    }

    /// Raw payload of `key` if present and stamped with the key's current
    /// watermark.
    async fn get_current<T: serde::de::DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let stamped = match serde_json::from_slice::<Stamped<T>>(&bytes) {
            Ok(stamped) => stamped,
            Err(e) => return self.corrupt(key, e.to_string()).await,
        };
        let current = self.journal.watermark(key).await?;
        if stamped.watermark != current.sequence {
            tracing::debug!(
                key = %key,
                stamped = stamped.watermark,
                current = current.sequence,
                "Ignoring cache entry written before the latest change"
            );
            if let Err(e) = self.backend.delete(key).await {
                tracing::debug!(key = %key, error = %e, "Failed to evict outdated cache entry");
            }
            return Ok(None);
        }
        Ok(Some(stamped.value))
    }

    async fn corrupt<T>(&self, key: &CacheKey, reason: String) -> Result<T, CacheError> {
        tracing::warn!(key = %key, reason = %reason, "Evicting unreadable cache entry");
        if let Err(e) = self.backend.delete(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to evict unreadable cache entry");
        }
        Err(CacheError::CorruptEntry {
            key: key.encode(),
            reason,
        })
    }

    /// Current watermark of `key`. Snapshot this before querying the source
    /// of truth and hand it to `populate_*`.
    pub async fn watermark(&self, key: &CacheKey) -> Result<Watermark, CacheError> {
        self.journal.watermark(key).await
    }

    /// Cache an entity fetched after a miss, unless it changed since `seen`.
    pub async fn populate_entity(
        &self,
        entity: &Entity,
        seen: Watermark,
    ) -> Result<PopulateOutcome, CacheError> {
        let bytes = encode(&Stamped {
            watermark: seen.sequence,
            value: CachedEntity::from(entity),
        })?;
        self.populate(&CacheKey::Entity(entity.id), bytes, seen).await
    }

    /// Cache a listing fetched after a miss, unless it changed since `seen`.
    pub async fn populate_listing(
        &self,
        entities: &[Entity],
        seen: Watermark,
    ) -> Result<PopulateOutcome, CacheError> {
        let bytes = encode(&Stamped {
            watermark: seen.sequence,
            value: CachedListing::from(entities),
        })?;
        self.populate(&CacheKey::All, bytes, seen).await
    }

    async fn populate(
        &self,
        key: &CacheKey,
        bytes: Vec<u8>,
        seen: Watermark,
    ) -> Result<PopulateOutcome, CacheError> {
        self.backend.put(key, bytes, self.ttl).await?;
        let now = self.journal.watermark(key).await?;
        if now.is_newer_than(&seen) {
            self.backend.delete(key).await?;
            return Ok(PopulateOutcome::Discarded);
        }
        Ok(PopulateOutcome::Stored)
    }

    /// Evict one key.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.backend.delete(key).await
    }

    /// Bring the cache in line with a committed mutation of `id`.
    ///
    /// `current` is the entity as stored after the apply, `None` after a
    /// delete. The change is journaled first: from then on older entries of
    /// both keys read as misses, even if the backend writes below fail.
    pub async fn entity_applied(&self, id: EntityId, current: Option<&Entity>) -> Result<(), CacheError> {
        let key = CacheKey::Entity(id);
        let mark = self.journal.record_change(&key).await?;
        self.journal.record_change(&CacheKey::All).await?;

        match current {
            Some(entity) => {
                let bytes = encode(&Stamped {
                    watermark: mark.sequence,
                    value: CachedEntity::from(entity),
                })?;
                self.backend.put(&key, bytes, self.ttl).await?;
            }
            None => self.backend.delete(&key).await?,
        }
        self.backend.delete(&CacheKey::All).await
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.backend.stats().await
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(value).map_err(|e| CacheError::CorruptEntry {
        key: String::new(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryCacheBackend, InMemoryChangeJournal};
    use pantry_core::{new_entity_id, EntityFields};

    fn cache() -> (ReadCache, InMemoryCacheBackend) {
        let backend = InMemoryCacheBackend::new();
        let cache = ReadCache::new(
            Arc::new(backend.clone()),
            Arc::new(InMemoryChangeJournal::new()),
            Duration::from_secs(600),
        );
        (cache, backend)
    }

    fn entity(name: &str) -> Entity {
        Entity::new(new_entity_id(), EntityFields::new(name, "water", 10)).unwrap()
    }

    #[tokio::test]
    async fn test_populate_then_hit() {
        let (cache, _) = cache();
        let soup = entity("Soup");
        let seen = cache.watermark(&CacheKey::Entity(soup.id)).await.unwrap();

        let outcome = cache.populate_entity(&soup, seen).await.unwrap();
        assert_eq!(outcome, PopulateOutcome::Stored);
        assert_eq!(cache.get_entity(soup.id).await.unwrap(), Some(soup));
    }

    #[tokio::test]
    async fn test_populate_discarded_after_concurrent_apply() {
        let (cache, backend) = cache();
        let stale = entity("Soup");
        let seen = cache.watermark(&CacheKey::Entity(stale.id)).await.unwrap();

        // An apply lands between the reader's fetch and its cache write.
        let mut fresh = stale.clone();
        fresh.name = "Better Soup".to_string();
        cache.entity_applied(fresh.id, Some(&fresh)).await.unwrap();

        let outcome = cache.populate_entity(&stale, seen).await.unwrap();
        assert_eq!(outcome, PopulateOutcome::Discarded);
        assert!(!backend.contains(&CacheKey::Entity(stale.id)));
        assert_ne!(cache.get_entity(stale.id).await.unwrap(), Some(stale));
    }

    #[tokio::test]
    async fn test_entity_applied_overwrites_and_evicts_listing() {
        let (cache, backend) = cache();
        let soup = entity("Soup");
        let seen = cache.watermark(&CacheKey::All).await.unwrap();
        cache.populate_listing(std::slice::from_ref(&soup), seen).await.unwrap();
        assert!(backend.contains(&CacheKey::All));

        let mut updated = soup.clone();
        updated.duration = 20;
        cache.entity_applied(soup.id, Some(&updated)).await.unwrap();

        assert!(!backend.contains(&CacheKey::All));
        assert_eq!(cache.get_entity(soup.id).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_entity_applied_delete_evicts() {
        let (cache, backend) = cache();
        let soup = entity("Soup");
        let seen = cache.watermark(&CacheKey::Entity(soup.id)).await.unwrap();
        cache.populate_entity(&soup, seen).await.unwrap();

        cache.entity_applied(soup.id, None).await.unwrap();
        assert!(!backend.contains(&CacheKey::Entity(soup.id)));
        assert_eq!(cache.get_entity(soup.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entry_left_by_failed_apply_reads_as_miss() {
        let (cache, backend) = cache();
        let soup = entity("Soup");
        let seen = cache.watermark(&CacheKey::Entity(soup.id)).await.unwrap();
        cache.populate_entity(&soup, seen).await.unwrap();
        let seen = cache.watermark(&CacheKey::All).await.unwrap();
        cache.populate_listing(std::slice::from_ref(&soup), seen).await.unwrap();

        let mut stew = soup.clone();
        stew.name = "Stew".to_string();
        backend.set_available(false);
        assert!(cache.entity_applied(soup.id, Some(&stew)).await.is_err());
        backend.set_available(true);

        // The old entries are still there but no longer served.
        assert!(backend.contains(&CacheKey::Entity(soup.id)));
        assert!(backend.contains(&CacheKey::All));
        assert_eq!(cache.get_entity(soup.id).await.unwrap(), None);
        assert_eq!(cache.get_listing().await.unwrap(), None);
        assert!(!backend.contains(&CacheKey::Entity(soup.id)));
    }

    #[tokio::test]
    async fn test_entry_from_previous_journal_reads_as_miss() {
        let backend = InMemoryCacheBackend::new();
        let soup = entity("Soup");
        let first = ReadCache::new(
            Arc::new(backend.clone()),
            Arc::new(InMemoryChangeJournal::new()),
            Duration::from_secs(600),
        );
        first.entity_applied(soup.id, Some(&soup)).await.unwrap();
        assert_eq!(first.get_entity(soup.id).await.unwrap(), Some(soup.clone()));

        // A restart keeps the backend but starts a fresh journal.
        let second = ReadCache::new(
            Arc::new(backend.clone()),
            Arc::new(InMemoryChangeJournal::new()),
            Duration::from_secs(600),
        );
        assert_eq!(second.get_entity(soup.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_evicted() {
        let (cache, backend) = cache();
        let id = new_entity_id();
        backend
            .put(&CacheKey::Entity(id), b"{not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let err = cache.get_entity(id).await.unwrap_err();
        assert!(matches!(err, CacheError::CorruptEntry { .. }));
        assert!(!backend.contains(&CacheKey::Entity(id)));
    }

    #[tokio::test]
    async fn test_listing_round_trip_preserves_order() {
        let (cache, _) = cache();
        let entities = vec![entity("A"), entity("B"), entity("C")];
        let seen = cache.watermark(&CacheKey::All).await.unwrap();
        cache.populate_listing(&entities, seen).await.unwrap();
        assert_eq!(cache.get_listing().await.unwrap(), Some(entities));
    }
}
