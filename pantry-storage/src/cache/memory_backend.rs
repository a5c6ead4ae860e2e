//! In-process cache backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pantry_core::CacheError;

use super::key::CacheKey;
use super::traits::{CacheBackend, CacheStats};

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory cache backend with lazy expiry.
///
/// [`InMemoryCacheBackend::set_available`] simulates an outage: while
/// unavailable every call fails with `CacheError::Unavailable`.
#[derive(Debug, Clone)]
pub struct InMemoryCacheBackend {
    slots: Arc<RwLock<HashMap<CacheKey, Slot>>>,
    available: Arc<AtomicBool>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    expirations: Arc<AtomicU64>,
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            expirations: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether a live entry exists for `key`, without touching statistics.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots
            .read()
            .map(|slots| {
                slots
                    .get(key)
                    .is_some_and(|slot| slot.expires_at > Instant::now())
            })
            .unwrap_or(false)
    }

    fn ensure_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable {
                reason: "cache backend offline".to_string(),
            })
        }
    }

    fn poisoned() -> CacheError {
        CacheError::Unavailable {
            reason: "cache lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        self.ensure_available()?;
        let now = Instant::now();
        {
            let slots = self.slots.read().map_err(|_| Self::poisoned())?;
            match slots.get(key) {
                Some(slot) if slot.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(slot.value.clone()));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            }
        }

        // Expired: drop it unless someone refreshed it meanwhile.
        let mut slots = self.slots.write().map_err(|_| Self::poisoned())?;
        if slots.get(key).is_some_and(|slot| slot.expires_at <= now) {
            slots.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.ensure_available()?;
        let mut slots = self.slots.write().map_err(|_| Self::poisoned())?;
        slots.insert(
            *key,
            Slot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.ensure_available()?;
        let mut slots = self.slots.write().map_err(|_| Self::poisoned())?;
        slots.remove(key);
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.ensure_available()?;
        let slots = self.slots.read().map_err(|_| Self::poisoned())?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: slots.len() as u64,
            expirations: self.expirations.load(Ordering::Relaxed),
        })
    }
}
