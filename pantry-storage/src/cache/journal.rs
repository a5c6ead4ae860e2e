//! Watermarks and the change journal.
//!
//! The journal counts applied mutations per cache key. A reader snapshots the
//! watermark of a key before fetching from the source of truth; if the
//! watermark moved by the time the fetched value lands in the cache, the
//! value may predate an apply and must not be kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pantry_core::CacheError;

use super::key::CacheKey;

/// A point in the change history of one cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    /// Monotonically increasing; each recorded change moves it forward.
    pub sequence: u64,
    /// When this watermark was observed.
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            observed_at: Utc::now(),
        }
    }

    /// Create a zero watermark (no change recorded yet).
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

/// Change journal keyed by cache key.
#[async_trait]
pub trait ChangeJournal: Send + Sync {
    /// Current watermark of `key`.
    async fn watermark(&self, key: &CacheKey) -> Result<Watermark, CacheError>;

    /// Record a change affecting `key` and return the new watermark.
    async fn record_change(&self, key: &CacheKey) -> Result<Watermark, CacheError>;
}

/// Process-local change journal.
///
/// Sequences come from one global counter, so watermarks of different keys
/// are comparable. The counter starts at the current time in microseconds so
/// a restarted process does not reissue stamps still present in a persistent
/// cache backend.
#[derive(Debug)]
pub struct InMemoryChangeJournal {
    counter: AtomicU64,
    latest: RwLock<HashMap<CacheKey, u64>>,
}

impl InMemoryChangeJournal {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(Utc::now().timestamp_micros().max(0) as u64),
            latest: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryChangeJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeJournal for InMemoryChangeJournal {
    async fn watermark(&self, key: &CacheKey) -> Result<Watermark, CacheError> {
        let latest = self.latest.read().map_err(|_| CacheError::Unavailable {
            reason: "change journal lock poisoned".to_string(),
        })?;
        Ok(latest
            .get(key)
            .map(|sequence| Watermark::new(*sequence))
            .unwrap_or_else(Watermark::zero))
    }

    async fn record_change(&self, key: &CacheKey) -> Result<Watermark, CacheError> {
        let mut latest = self.latest.write().map_err(|_| CacheError::Unavailable {
            reason: "change journal lock poisoned".to_string(),
        })?;
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        latest.insert(*key, sequence);
        Ok(Watermark::new(sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::new_entity_id;

    #[tokio::test]
    async fn test_unknown_key_is_zero() {
        let journal = InMemoryChangeJournal::new();
        let mark = journal.watermark(&CacheKey::All).await.unwrap();
        assert_eq!(mark.sequence, 0);
    }

    #[tokio::test]
    async fn test_record_change_moves_only_that_key() {
        let journal = InMemoryChangeJournal::new();
        let a = CacheKey::Entity(new_entity_id());
        let b = CacheKey::Entity(new_entity_id());

        let before_a = journal.watermark(&a).await.unwrap();
        let before_b = journal.watermark(&b).await.unwrap();
        let recorded = journal.record_change(&a).await.unwrap();

        let after_a = journal.watermark(&a).await.unwrap();
        let after_b = journal.watermark(&b).await.unwrap();
        assert!(after_a.is_newer_than(&before_a));
        assert_eq!(after_a.sequence, recorded.sequence);
        assert_eq!(after_b.sequence, before_b.sequence);
    }

    #[tokio::test]
    async fn test_sequences_are_global() {
        let journal = InMemoryChangeJournal::new();
        let first = journal.record_change(&CacheKey::All).await.unwrap();
        let second = journal
            .record_change(&CacheKey::Entity(new_entity_id()))
            .await
            .unwrap();
        assert!(second.is_newer_than(&first));
    }
}
