//! Error types for PANTRY operations

use crate::{CommandKind, EntityId};
use thiserror::Error;

/// Validation errors. Raised synchronously at submission, never inside the
/// asynchronous pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Entity store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Stored record for {id} is corrupt: {reason}")]
    CorruptRecord { id: EntityId, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Command broker errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("No queue bound for routing key {routing_key}")]
    Unroutable { routing_key: String },

    #[error("Unknown delivery tag {tag}")]
    UnknownDelivery { tag: u64 },
}

/// Read cache errors. Never surfaced to a reader.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cached value under {key} is unreadable: {reason}")]
    CorruptEntry { key: String, reason: String },
}

/// Terminal apply failure: the precondition of a command never became true
/// within the retry budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} for {entity_id} could not be applied after {attempts} attempts: {reason}")]
pub struct ApplyConflictError {
    pub kind: CommandKind,
    pub entity_id: EntityId,
    pub attempts: u32,
    pub reason: String,
}

/// Master error type for all PANTRY operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PantryError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Entity not found: {id}")]
    NotFound { id: EntityId },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Apply conflict: {0}")]
    ApplyConflict(#[from] ApplyConflictError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Query service unavailable: {reason}")]
    QueryUnavailable { reason: String },
}

impl PantryError {
    /// Build a serialization error from anything displayable.
    pub fn serialization(reason: impl std::fmt::Display) -> Self {
        PantryError::Serialization {
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for PantryError {
    fn from(err: serde_json::Error) -> Self {
        PantryError::serialization(err)
    }
}

/// Result type for PANTRY operations.
pub type PantryResult<T> = Result<T, PantryError>;
