//! Shared wiring for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pantry_api::{Backends, PantryConfig, Runtime};
use pantry_core::{Entity, EntityId};
use pantry_storage::EntityStore;
use pantry_test_utils::{fixtures, InMemoryBackends, TEST_POLL_INTERVAL};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Config tuned for tests: fast retries, fast broker polling.
pub fn test_config(max_attempts: u32) -> PantryConfig {
    PantryConfig {
        retry: fixtures::fast_retry(max_attempts),
        broker_poll_interval: TEST_POLL_INTERVAL,
        query_timeout: Duration::from_secs(2),
        consumers_per_queue: 2,
        ..PantryConfig::default()
    }
}

pub fn into_backends(memory: &InMemoryBackends) -> Backends {
    Backends {
        broker: Arc::new(memory.broker.clone()),
        store: Arc::new(memory.store.clone()),
        ledger: Arc::new(memory.ledger.clone()),
        dead_letters: Arc::new(memory.dead_letters.clone()),
        cache: Arc::new(memory.cache.clone()),
    }
}

/// An in-memory service with handles on every backend.
pub struct TestHarness {
    pub memory: InMemoryBackends,
    pub runtime: Runtime,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl TestHarness {
    /// Wired but idle: no workers run until [`TestHarness::start`].
    pub fn idle(max_attempts: u32) -> Self {
        let memory = InMemoryBackends::new();
        let runtime = Runtime::build(&test_config(max_attempts), into_backends(&memory))
            .expect("runtime should build");
        let (shutdown, _) = watch::channel(false);
        Self {
            memory,
            runtime,
            shutdown,
            workers: Vec::new(),
        }
    }

    /// Wired with workers running and a three-attempt retry budget.
    pub fn started() -> Self {
        let mut harness = Self::idle(3);
        harness.start();
        harness
    }

    pub fn start(&mut self) {
        let workers = self.runtime.spawn_workers(self.shutdown.subscribe());
        self.workers.extend(workers);
    }

    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        for worker in self.workers.drain(..) {
            worker.await.expect("worker should exit cleanly");
        }
    }

    pub async fn stored(&self, id: EntityId) -> Option<Entity> {
        self.memory.store.get(id).await.expect("store read should succeed")
    }
}
