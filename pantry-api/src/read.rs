//! Read Orchestrator
//!
//! Cache-aside reads. A hit is returned as is. On a miss the orchestrator
//! snapshots the key's watermark, asks the query service (bounded by a
//! timeout), and caches the answer unless the key changed in the meantime.
//!
//! The cache never decides an outcome: cache errors fall through to the
//! query service and `NotFound` is never cached.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pantry_core::{Entity, EntityId, PantryError, PantryResult};
use pantry_storage::cache::{CacheKey, PopulateOutcome, ReadCache, Watermark};

use crate::query::QueryService;

#[derive(Clone)]
pub struct ReadOrchestrator {
    cache: ReadCache,
    query: Arc<dyn QueryService>,
    timeout: Duration,
}

impl ReadOrchestrator {
    pub fn new(cache: ReadCache, query: Arc<dyn QueryService>, timeout: Duration) -> Self {
        Self {
            cache,
            query,
            timeout,
        }
    }

    pub async fn get_one(&self, id: EntityId) -> PantryResult<Entity> {
        let key = CacheKey::Entity(id);
        match self.cache.get_entity(id).await {
            Ok(Some(entity)) => {
                tracing::trace!(key = %key, "Cache hit");
                return Ok(entity);
            }
            Ok(None) => tracing::trace!(key = %key, "Cache miss"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Cache read failed, querying source"),
        }

        let seen = self.snapshot(&key).await;
        let entity = self.bounded("get_one", self.query.get_one(id)).await?;

        if let Some(seen) = seen {
            let outcome = self.cache.populate_entity(&entity, seen).await;
            self.log_populate(&key, outcome);
        }
        Ok(entity)
    }

    pub async fn list_all(&self) -> PantryResult<Vec<Entity>> {
        let key = CacheKey::All;
        match self.cache.get_listing().await {
            Ok(Some(entities)) => {
                tracing::trace!(key = %key, "Cache hit");
                return Ok(entities);
            }
            Ok(None) => tracing::trace!(key = %key, "Cache miss"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Cache read failed, querying source"),
        }

        let seen = self.snapshot(&key).await;
        let entities = self.bounded("list_all", self.query.list_all()).await?;

        if let Some(seen) = seen {
            let outcome = self.cache.populate_listing(&entities, seen).await;
            self.log_populate(&key, outcome);
        }
        Ok(entities)
    }

    /// Watermark to guard the populate with. `None` skips populating.
    async fn snapshot(&self, key: &CacheKey) -> Option<Watermark> {
        match self.cache.watermark(key).await {
            Ok(seen) => Some(seen),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Change journal unavailable, not caching");
                None
            }
        }
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> PantryResult<T>
    where
        F: Future<Output = PantryResult<T>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(operation, elapsed_ms, "Query service call timed out");
                Err(PantryError::Timeout {
                    operation: operation.to_string(),
                    elapsed_ms,
                })
            }
        }
    }

    fn log_populate(&self, key: &CacheKey, outcome: Result<PopulateOutcome, pantry_core::CacheError>) {
        match outcome {
            Ok(PopulateOutcome::Stored) => tracing::trace!(key = %key, "Cache populated"),
            Ok(PopulateOutcome::Discarded) => {
                tracing::debug!(key = %key, "Key changed during query, cached value discarded")
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "Cache populate failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::StoreQueryService;
    use async_trait::async_trait;
    use pantry_core::{new_entity_id, EntityFields};
    use pantry_storage::cache::{CacheBackend, InMemoryCacheBackend, InMemoryChangeJournal};
    use pantry_storage::{EntityStore, InMemoryEntityStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and optionally stalls.
    struct CountingQuery {
        inner: StoreQueryService,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl QueryService for CountingQuery {
        async fn get_one(&self, id: EntityId) -> PantryResult<Entity> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.get_one(id).await
        }

        async fn list_all(&self) -> PantryResult<Vec<Entity>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.list_all().await
        }
    }

    struct Fixture {
        reads: ReadOrchestrator,
        store: InMemoryEntityStore,
        backend: InMemoryCacheBackend,
        query: Arc<CountingQuery>,
    }

    fn fixture(delay: Duration, timeout: Duration) -> Fixture {
        let store = InMemoryEntityStore::new();
        let backend = InMemoryCacheBackend::new();
        let cache = ReadCache::new(
            Arc::new(backend.clone()),
            Arc::new(InMemoryChangeJournal::new()),
            Duration::from_secs(600),
        );
        let query = Arc::new(CountingQuery {
            inner: StoreQueryService::new(Arc::new(store.clone())),
            calls: AtomicUsize::new(0),
            delay,
        });
        Fixture {
            reads: ReadOrchestrator::new(cache, query.clone(), timeout),
            store,
            backend,
            query,
        }
    }

    fn soup() -> Entity {
        Entity::new(new_entity_id(), EntityFields::new("Soup", "water,salt", 10)).unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let f = fixture(Duration::ZERO, Duration::from_secs(1));
        let soup = soup();
        f.store.put(&soup).await.unwrap();

        assert_eq!(f.reads.get_one(soup.id).await.unwrap(), soup);
        assert_eq!(f.reads.get_one(soup.id).await.unwrap(), soup);
        assert_eq!(f.query.calls.load(Ordering::SeqCst), 1);
        assert!(f.backend.contains(&CacheKey::Entity(soup.id)));
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let f = fixture(Duration::ZERO, Duration::from_secs(1));
        let id = new_entity_id();
        for _ in 0..2 {
            assert_eq!(
                f.reads.get_one(id).await.unwrap_err(),
                PantryError::NotFound { id }
            );
        }
        assert_eq!(f.query.calls.load(Ordering::SeqCst), 2);
        assert!(!f.backend.contains(&CacheKey::Entity(id)));
    }

    #[tokio::test]
    async fn test_cache_outage_falls_back() {
        let f = fixture(Duration::ZERO, Duration::from_secs(1));
        let soup = soup();
        f.store.put(&soup).await.unwrap();
        f.backend.set_available(false);

        assert_eq!(f.reads.get_one(soup.id).await.unwrap(), soup);
        assert_eq!(f.reads.list_all().await.unwrap(), vec![soup]);
    }

    #[tokio::test]
    async fn test_listing_cached_until_evicted() {
        let f = fixture(Duration::ZERO, Duration::from_secs(1));
        let soup = soup();
        f.store.put(&soup).await.unwrap();

        assert_eq!(f.reads.list_all().await.unwrap().len(), 1);
        f.store.delete(soup.id).await.unwrap();
        // Still served from cache until someone evicts it.
        assert_eq!(f.reads.list_all().await.unwrap().len(), 1);

        f.backend.delete(&CacheKey::All).await.unwrap();
        assert!(f.reads.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout() {
        let f = fixture(Duration::from_millis(200), Duration::from_millis(20));
        let err = f.reads.list_all().await.unwrap_err();
        assert!(matches!(err, PantryError::Timeout { ref operation, .. } if operation == "list_all"));
        assert!(!f.backend.contains(&CacheKey::All));
    }
}
