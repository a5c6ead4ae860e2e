//! PANTRY Test Utilities
//!
//! Shared test infrastructure for the PANTRY workspace:
//! - Proptest generators for entities, fields and commands
//! - Fixtures for the common recipes used across tests
//! - In-memory backends with their concrete handles kept for fault injection
//! - Polling helpers for asserting on eventually-consistent state

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use pantry_core::{
    Command, CommandKind, Entity, EntityFields, EntityId, PantryError, PantryResult,
    RetryConfig, ValidationError,
};

use pantry_broker::{InMemoryBroker, InMemoryDeadLetterStore, Topology};
use pantry_storage::cache::{InMemoryCacheBackend, InMemoryChangeJournal, ReadCache};
use pantry_storage::{InMemoryApplyLedger, InMemoryEntityStore};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for PANTRY types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random entity id.
    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Non-blank text with no surrounding whitespace.
    pub fn arb_text() -> impl Strategy<Value = String> {
        "[A-Za-z0-9][A-Za-z0-9 ,]{0,30}[A-Za-z0-9]"
    }

    /// Text that is empty or whitespace only.
    pub fn arb_blank() -> impl Strategy<Value = String> {
        "[ \t]{0,4}"
    }

    pub fn arb_duration() -> impl Strategy<Value = i64> {
        1i64..=10_000
    }

    pub fn arb_non_positive_duration() -> impl Strategy<Value = i64> {
        prop_oneof![Just(0i64), Just(i64::MIN), -10_000i64..=0]
    }

    /// Fields that pass validation.
    pub fn arb_entity_fields() -> impl Strategy<Value = EntityFields> {
        (arb_text(), arb_text(), arb_duration())
            .prop_map(|(name, ingredients, duration)| EntityFields::new(name, ingredients, duration))
    }

    /// Fields that break exactly one invariant.
    pub fn arb_invalid_entity_fields() -> impl Strategy<Value = EntityFields> {
        prop_oneof![
            (arb_blank(), arb_text(), arb_duration())
                .prop_map(|(n, i, d)| EntityFields::new(n, i, d)),
            (arb_text(), arb_blank(), arb_duration())
                .prop_map(|(n, i, d)| EntityFields::new(n, i, d)),
            (arb_text(), arb_text(), arb_non_positive_duration())
                .prop_map(|(n, i, d)| EntityFields::new(n, i, d)),
        ]
    }

    pub fn arb_entity() -> impl Strategy<Value = Entity> {
        (arb_entity_id(), arb_entity_fields()).prop_filter_map("valid entity", |(id, fields)| {
            Entity::new(id, fields).ok()
        })
    }

    pub fn arb_command_kind() -> impl Strategy<Value = CommandKind> {
        prop_oneof![
            Just(CommandKind::Create),
            Just(CommandKind::Update),
            Just(CommandKind::Delete),
        ]
    }

    /// A first-attempt command for `entity_id` with the given sequence.
    pub fn arb_command_for(entity_id: EntityId, sequence: u64) -> impl Strategy<Value = Command> {
        (arb_command_kind(), arb_entity_fields()).prop_map(move |(kind, fields)| match kind {
            CommandKind::Create => Command::create(entity_id, fields, sequence),
            CommandKind::Update => Command::update(entity_id, fields, sequence),
            CommandKind::Delete => Command::delete(entity_id, sequence),
        })
    }

    pub fn arb_command() -> impl Strategy<Value = Command> {
        (arb_entity_id(), 1u64..u64::MAX / 2)
            .prop_flat_map(|(entity_id, sequence)| arb_command_for(entity_id, sequence))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;

    pub fn soup_fields() -> EntityFields {
        EntityFields::new("Soup", "water,salt", 10)
    }

    pub fn stew_fields() -> EntityFields {
        EntityFields::new("Stew", "beef,carrot,onion", 90)
    }

    pub fn soup(id: EntityId) -> Entity {
        Entity {
            id,
            name: "Soup".to_string(),
            ingredients: "water,salt".to_string(),
            duration: 10,
        }
    }

    /// Retry schedule short enough for tests: `attempts` tries, 5ms apart.
    pub fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        }
    }
}

// ============================================================================
// IN-MEMORY BACKENDS
// ============================================================================

/// Polling interval of the test broker. Delayed retries become visible after
/// at most this long.
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Every in-memory backend, keeping the concrete types so tests can inject
/// faults (`set_available`, `set_fail_writes`, `recover_unacked`).
#[derive(Debug, Clone)]
pub struct InMemoryBackends {
    pub broker: InMemoryBroker,
    pub store: InMemoryEntityStore,
    pub ledger: InMemoryApplyLedger,
    pub dead_letters: InMemoryDeadLetterStore,
    pub cache: InMemoryCacheBackend,
    pub journal: Arc<InMemoryChangeJournal>,
}

impl Default for InMemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackends {
    pub fn new() -> Self {
        Self {
            broker: InMemoryBroker::new(Topology::entity_default())
                .with_poll_interval(TEST_POLL_INTERVAL),
            store: InMemoryEntityStore::new(),
            ledger: InMemoryApplyLedger::new(),
            dead_letters: InMemoryDeadLetterStore::new(),
            cache: InMemoryCacheBackend::new(),
            journal: Arc::new(InMemoryChangeJournal::new()),
        }
    }

    /// A read cache over these backends.
    pub fn read_cache(&self, ttl: Duration) -> ReadCache {
        ReadCache::new(Arc::new(self.cache.clone()), self.journal.clone(), ttl)
    }
}

// ============================================================================
// POLLING HELPERS
// ============================================================================

/// Default bound for [`eventually`].
pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `check` until it returns `true` or `timeout` passes. Returns whether
/// the condition was reached.
pub async fn eventually_within<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// [`eventually_within`] with [`EVENTUALLY_TIMEOUT`], panicking with
/// `what` when the condition is never reached.
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    assert!(
        eventually_within(EVENTUALLY_TIMEOUT, check).await,
        "timed out waiting for: {}",
        what
    );
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over PANTRY results.

    use super::*;

    pub fn assert_not_found<T: std::fmt::Debug>(result: &PantryResult<T>, id: EntityId) {
        assert!(
            matches!(result, Err(PantryError::NotFound { id: found }) if *found == id),
            "Expected NotFound for {}, got: {:?}",
            id,
            result
        );
    }

    pub fn assert_validation_error<T: std::fmt::Debug>(result: &PantryResult<T>) {
        assert!(
            matches!(result, Err(PantryError::Validation(_))),
            "Expected ValidationError, got: {:?}",
            result
        );
    }
}
