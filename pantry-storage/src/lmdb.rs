//! LMDB-backed entity store and apply ledger.
//!
//! One environment holds four named databases:
//!
//! - `entities`: `id (16 bytes)` -> `[insert position: 8 bytes BE][json entity]`
//! - `order`: `insert position (8 bytes BE)` -> `id (16 bytes)`
//! - `ledger`: `id (16 bytes)` -> `sequence (8 bytes BE)`
//! - `meta`: counters, including the highest sequence in `ledger`
//!
//! Write transactions are serialized by LMDB, so the insert position counter
//! needs no extra locking.

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use pantry_core::{Entity, EntityId, PantryError, PantryResult, StorageError};
use uuid::Uuid;

use crate::{ApplyLedger, EntityStore};

const NEXT_INSERT_KEY: &[u8] = b"next_insert";
const LEDGER_HIGH_WATER_KEY: &[u8] = b"ledger_high_water";

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for PantryError {
    fn from(e: LmdbStoreError) -> Self {
        PantryError::Store(StorageError::TransactionFailed {
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> PantryError {
    PantryError::Store(StorageError::TransactionFailed {
        reason: e.to_string(),
    })
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

/// Open (or create) an LMDB environment with room for `max_dbs` named databases.
pub(crate) fn open_env<P: AsRef<Path>>(
    path: P,
    max_size_mb: usize,
    max_dbs: u32,
) -> Result<Env, LmdbStoreError> {
    std::fs::create_dir_all(&path)?;

    // SAFETY: each environment path is opened once per process by its owner.
    unsafe {
        EnvOpenOptions::new()
            .map_size(max_size_mb * 1024 * 1024)
            .max_dbs(max_dbs)
            .open(path.as_ref())
    }
    .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))
}

/// LMDB-backed entity store.
#[derive(Clone)]
pub struct LmdbEntityStore {
    env: Env,
    entities: Database<Bytes, Bytes>,
    order: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    ledger: Database<Bytes, Bytes>,
}

impl LmdbEntityStore {
    /// Open the store under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// environment or one of its databases cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        let env = open_env(path, max_size_mb, 4)?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        let entities: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("entities"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        let order: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("order"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        let meta: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        let ledger: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("ledger"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            entities,
            order,
            meta,
            ledger,
        })
    }

    /// The apply ledger living in the same environment.
    pub fn apply_ledger(&self) -> LmdbApplyLedger {
        LmdbApplyLedger {
            env: self.env.clone(),
            ledger: self.ledger,
            meta: self.meta,
        }
    }

    fn next_insert_position(&self, wtxn: &mut RwTxn) -> PantryResult<u64> {
        let current = self
            .meta
            .get(&*wtxn, NEXT_INSERT_KEY)
            .map_err(txn_err)?
            .and_then(decode_u64)
            .unwrap_or(0);
        self.meta
            .put(wtxn, NEXT_INSERT_KEY, &(current + 1).to_be_bytes())
            .map_err(txn_err)?;
        Ok(current)
    }

    fn decode_entity(id: EntityId, bytes: &[u8]) -> PantryResult<(u64, Entity)> {
        let position = decode_u64(bytes).ok_or_else(|| StorageError::CorruptRecord {
            id,
            reason: "record shorter than its header".to_string(),
        })?;
        let entity: Entity =
            serde_json::from_slice(&bytes[8..]).map_err(|e| StorageError::CorruptRecord {
                id,
                reason: e.to_string(),
            })?;
        Ok((position, entity))
    }
}

#[async_trait]
impl EntityStore for LmdbEntityStore {
    async fn get(&self, id: EntityId) -> PantryResult<Option<Entity>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.entities.get(&rtxn, id.as_bytes()).map_err(txn_err)? {
            Some(bytes) => Self::decode_entity(id, bytes).map(|(_, entity)| Some(entity)),
            None => Ok(None),
        }
    }

    async fn put(&self, entity: &Entity) -> PantryResult<()> {
        let json = serde_json::to_vec(entity)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let existing = self
            .entities
            .get(&wtxn, entity.id.as_bytes())
            .map_err(txn_err)?
            .and_then(decode_u64);
        let position = match existing {
            Some(position) => position,
            None => {
                let position = self.next_insert_position(&mut wtxn)?;
                self.order
                    .put(&mut wtxn, &position.to_be_bytes(), entity.id.as_bytes())
                    .map_err(txn_err)?;
                position
            }
        };

        let mut value = Vec::with_capacity(8 + json.len());
        value.extend_from_slice(&position.to_be_bytes());
        value.extend_from_slice(&json);
        self.entities
            .put(&mut wtxn, entity.id.as_bytes(), &value)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    async fn delete(&self, id: EntityId) -> PantryResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let position = self
            .entities
            .get(&wtxn, id.as_bytes())
            .map_err(txn_err)?
            .and_then(decode_u64);
        let Some(position) = position else {
            return Ok(false);
        };
        self.order
            .delete(&mut wtxn, &position.to_be_bytes())
            .map_err(txn_err)?;
        self.entities.delete(&mut wtxn, id.as_bytes()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn list_all(&self) -> PantryResult<Vec<Entity>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut entities = Vec::new();
        for item in self.order.iter(&rtxn).map_err(txn_err)? {
            let (_, raw_id) = item.map_err(txn_err)?;
            let id = Uuid::from_slice(raw_id).map_err(|e| StorageError::TransactionFailed {
                reason: format!("corrupt ordering index: {}", e),
            })?;
            let bytes = self
                .entities
                .get(&rtxn, id.as_bytes())
                .map_err(txn_err)?
                .ok_or_else(|| StorageError::CorruptRecord {
                    id,
                    reason: "ordering index points at a missing entity".to_string(),
                })?;
            entities.push(Self::decode_entity(id, bytes)?.1);
        }
        Ok(entities)
    }
}

/// LMDB-backed apply ledger. Obtained from [`LmdbEntityStore::apply_ledger`].
#[derive(Clone)]
pub struct LmdbApplyLedger {
    env: Env,
    ledger: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
}

#[async_trait]
impl ApplyLedger for LmdbApplyLedger {
    async fn last_applied(&self, id: EntityId) -> PantryResult<Option<u64>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self
            .ledger
            .get(&rtxn, id.as_bytes())
            .map_err(txn_err)?
            .and_then(decode_u64))
    }

    async fn record_applied(&self, id: EntityId, sequence: u64) -> PantryResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let current = self
            .ledger
            .get(&wtxn, id.as_bytes())
            .map_err(txn_err)?
            .and_then(decode_u64);
        if current.is_some_and(|current| current >= sequence) {
            return Ok(());
        }
        self.ledger
            .put(&mut wtxn, id.as_bytes(), &sequence.to_be_bytes())
            .map_err(txn_err)?;

        let high_water = self
            .meta
            .get(&wtxn, LEDGER_HIGH_WATER_KEY)
            .map_err(txn_err)?
            .and_then(decode_u64)
            .unwrap_or(0);
        if sequence > high_water {
            self.meta
                .put(&mut wtxn, LEDGER_HIGH_WATER_KEY, &sequence.to_be_bytes())
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)
    }

    async fn high_water_mark(&self) -> PantryResult<u64> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self
            .meta
            .get(&rtxn, LEDGER_HIGH_WATER_KEY)
            .map_err(txn_err)?
            .and_then(decode_u64)
            .unwrap_or(0))
    }
}
