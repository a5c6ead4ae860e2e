//! Cache backend trait.

use std::time::Duration;

use async_trait::async_trait;
use pantry_core::CacheError;
use serde::Serialize;

use super::key::CacheKey;

/// Cache backend trait for pluggable cache implementations.
///
/// Backends store opaque bytes with an expiry. Expired entries must read as
/// absent. Implementations should be thread-safe and tolerate concurrent
/// writers to the same key (last write wins).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a live value. Returns `None` on miss or expiry.
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store a value for `ttl`.
    async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a value. Removing an absent key succeeds.
    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Get cache statistics.
    async fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including expired reads.
    pub misses: u64,
    /// Current number of entries (may include not-yet-collected expired ones).
    pub entry_count: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate.
    ///
    /// Returns 0.0 if there have been no requests.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
