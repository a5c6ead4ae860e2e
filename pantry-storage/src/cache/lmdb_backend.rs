//! LMDB-backed cache implementation.
//!
//! Uses heed to keep cached projections in a memory-mapped file, so a
//! restarted process starts warm. Values are stored as
//! `[expires_at: 8 bytes LE unix millis][payload]`; expired values are
//! treated as absent and removed on read.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use pantry_core::CacheError;

use super::key::CacheKey;
use super::traits::{CacheBackend, CacheStats};

/// Error type for LMDB cache setup.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        CacheError::Unavailable {
            reason: e.to_string(),
        }
    }
}

fn unavailable(e: heed::Error) -> CacheError {
    CacheError::Unavailable {
        reason: e.to_string(),
    }
}

/// LMDB-backed cache.
pub struct LmdbCacheBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

impl LmdbCacheBackend {
    /// Create a new LMDB cache backend.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the cache directory is owned by this backend alone.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    fn split_value(bytes: &[u8]) -> Option<(i64, &[u8])> {
        let header: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some((i64::from_le_bytes(header), &bytes[8..]))
    }

    fn remove_expired(&self, encoded_key: &[u8], now_millis: i64) -> Result<(), CacheError> {
        let mut wtxn = self.env.write_txn().map_err(unavailable)?;
        let still_expired = self
            .db
            .get(&wtxn, encoded_key)
            .map_err(unavailable)?
            .and_then(Self::split_value)
            .is_some_and(|(expires_at, _)| expires_at <= now_millis);
        if still_expired {
            self.db.delete(&mut wtxn, encoded_key).map_err(unavailable)?;
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        wtxn.commit().map_err(unavailable)
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let encoded_key = key.encode();
        let now_millis = Utc::now().timestamp_millis();

        let live = {
            let rtxn = self.env.read_txn().map_err(unavailable)?;
            match self.db.get(&rtxn, encoded_key.as_bytes()).map_err(unavailable)? {
                None => None,
                Some(bytes) => match Self::split_value(bytes) {
                    Some((expires_at, payload)) if expires_at > now_millis => {
                        Some(Some(payload.to_vec()))
                    }
                    // Expired or truncated.
                    _ => Some(None),
                },
            }
        };

        match live {
            Some(Some(payload)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(payload))
            }
            Some(None) => {
                self.remove_expired(encoded_key.as_bytes(), now_millis)?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let mut data = Vec::with_capacity(8 + value.len());
        data.extend_from_slice(&expires_at.to_le_bytes());
        data.extend_from_slice(&value);

        let mut wtxn = self.env.write_txn().map_err(unavailable)?;
        self.db
            .put(&mut wtxn, key.encode().as_bytes(), &data)
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut wtxn = self.env.write_txn().map_err(unavailable)?;
        self.db
            .delete(&mut wtxn, key.encode().as_bytes())
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let rtxn = self.env.read_txn().map_err(unavailable)?;
        let entry_count = self.db.len(&rtxn).map_err(unavailable)?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            expirations: self.expirations.load(Ordering::Relaxed),
        })
    }
}
