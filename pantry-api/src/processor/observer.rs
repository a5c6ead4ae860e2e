//! Post-apply notifications.

use std::time::Duration;

use async_trait::async_trait;
use pantry_core::{Command, Entity};
use pantry_storage::cache::ReadCache;

use crate::constants::{CACHE_INVALIDATION_ATTEMPTS, CACHE_INVALIDATION_BACKOFF_MS};

/// Told about every command that changed (or confirmed the absence of) an
/// entity. Runs while the entity's apply lock is still held.
#[async_trait]
pub trait ApplyObserver: Send + Sync {
    /// `current` is the stored entity after the apply, `None` after a delete.
    async fn entity_applied(&self, command: &Command, current: Option<&Entity>);
}

/// Keeps the read cache in line with applied commands.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: ReadCache,
    attempts: u32,
    backoff: Duration,
}

impl CacheInvalidator {
    pub fn new(cache: ReadCache) -> Self {
        Self {
            cache,
            attempts: CACHE_INVALIDATION_ATTEMPTS,
            backoff: Duration::from_millis(CACHE_INVALIDATION_BACKOFF_MS),
        }
    }
}

#[async_trait]
impl ApplyObserver for CacheInvalidator {
    async fn entity_applied(&self, command: &Command, current: Option<&Entity>) {
        for attempt in 1..=self.attempts {
            match self.cache.entity_applied(command.entity_id, current).await {
                Ok(()) => {
                    tracing::debug!(entity_id = %command.entity_id, "Cache updated after apply");
                    return;
                }
                Err(e) if attempt < self.attempts => {
                    tracing::warn!(
                        entity_id = %command.entity_id,
                        attempt,
                        error = %e,
                        "Cache update after apply failed, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    // The change is journaled, so outdated entries read as misses.
                    tracing::error!(
                        entity_id = %command.entity_id,
                        command_id = %command.command_id,
                        error = %e,
                        "Cache update after apply failed"
                    );
                }
            }
        }
    }
}
