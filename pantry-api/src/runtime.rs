//! Service wiring.
//!
//! [`Backends`] picks the storage, broker and cache implementations;
//! [`Runtime`] connects them into the publisher, processor, read
//! orchestrator and the two server surfaces.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use pantry_broker::{Broker, DeadLetterStore, InMemoryBroker, InMemoryDeadLetterStore, LmdbBroker, Topology};
use pantry_storage::cache::{CacheBackend, InMemoryCacheBackend, InMemoryChangeJournal, LmdbCacheBackend, ReadCache};
use pantry_storage::{ApplyLedger, EntityStore, InMemoryApplyLedger, InMemoryEntityStore, LmdbEntityStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::PantryConfig;
use crate::constants::{BROKER_DIR, CACHE_DIR, STORE_DIR};
use crate::error::{ApiError, ApiResult};
use crate::grpc::{self, EntityQueryService, GrpcQueryClient};
use crate::processor::{CacheInvalidator, CommandProcessor, HandlerRegistry, ProcessorDeps};
use crate::proto::entity_query_server::EntityQueryServer;
use crate::publisher::CommandPublisher;
use crate::query::{QueryService, StoreQueryService};
use crate::read::ReadOrchestrator;
use crate::routes;
use crate::state::AppState;

/// The pluggable parts of the service.
#[derive(Clone)]
pub struct Backends {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn EntityStore>,
    pub ledger: Arc<dyn ApplyLedger>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub cache: Arc<dyn CacheBackend>,
}

impl Backends {
    /// Everything in process memory. Lost on exit.
    pub fn in_memory(config: &PantryConfig) -> Self {
        let broker = InMemoryBroker::new(Topology::entity_default())
            .with_poll_interval(config.broker_poll_interval);
        Self {
            broker: Arc::new(broker),
            store: Arc::new(InMemoryEntityStore::new()),
            ledger: Arc::new(InMemoryApplyLedger::new()),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
            cache: Arc::new(InMemoryCacheBackend::new()),
        }
    }

    /// LMDB environments under `data_dir`: one for the store and ledger, one
    /// for the broker and dead letters, one for the cache.
    pub fn open(data_dir: &Path, config: &PantryConfig) -> ApiResult<Self> {
        let size = config.lmdb_max_size_mb;

        let store = LmdbEntityStore::open(data_dir.join(STORE_DIR), size)
            .map_err(|e| ApiError::internal_error(format!("Failed to open entity store: {}", e)))?;
        let broker = LmdbBroker::open(
            data_dir.join(BROKER_DIR),
            size,
            Topology::entity_default(),
            config.broker_poll_interval,
        )
        .map_err(|e| ApiError::internal_error(format!("Failed to open broker: {}", e)))?;
        let cache = LmdbCacheBackend::new(data_dir.join(CACHE_DIR), size)
            .map_err(|e| ApiError::internal_error(format!("Failed to open cache: {}", e)))?;

        tracing::info!(data_dir = %data_dir.display(), "Opened LMDB backends");

        Ok(Self {
            ledger: Arc::new(store.apply_ledger()),
            dead_letters: Arc::new(broker.dead_letter_store()),
            store: Arc::new(store),
            broker: Arc::new(broker),
            cache: Arc::new(cache),
        })
    }

    /// LMDB when `PANTRY_DATA_DIR` is set, memory otherwise.
    pub fn from_config(config: &PantryConfig) -> ApiResult<Self> {
        match &config.data_dir {
            Some(dir) => Self::open(dir, config),
            None => {
                tracing::warn!("PANTRY_DATA_DIR not set, state is kept in memory only");
                Ok(Self::in_memory(config))
            }
        }
    }
}

/// A fully wired service, not yet serving.
pub struct Runtime {
    pub state: AppState,
    pub processor: Arc<CommandProcessor>,
    /// Store-backed queries, served to remote readers over gRPC.
    pub local_query: Arc<dyn QueryService>,
    consumers_per_queue: usize,
}

impl Runtime {
    pub fn build(config: &PantryConfig, backends: Backends) -> ApiResult<Self> {
        let cache = ReadCache::new(
            backends.cache.clone(),
            Arc::new(InMemoryChangeJournal::new()),
            config.cache_ttl,
        );

        let local_query: Arc<dyn QueryService> =
            Arc::new(StoreQueryService::new(backends.store.clone()));
        let read_query: Arc<dyn QueryService> = match &config.query_endpoint {
            Some(endpoint) => {
                tracing::info!(endpoint = %endpoint, "Reading through remote query service");
                Arc::new(GrpcQueryClient::connect_lazy(endpoint.clone(), config.query_timeout)?)
            }
            None => local_query.clone(),
        };

        let publisher = Arc::new(CommandPublisher::new(
            backends.broker.clone(),
            cache.clone(),
            backends.ledger.clone(),
        ));
        let reads = ReadOrchestrator::new(cache.clone(), read_query, config.query_timeout);

        let processor = CommandProcessor::new(ProcessorDeps {
            broker: backends.broker,
            store: backends.store,
            ledger: backends.ledger,
            dead_letters: backends.dead_letters.clone(),
            registry: HandlerRegistry::entity_default(),
            observers: vec![Arc::new(CacheInvalidator::new(cache.clone()))],
            retry: config.retry.clone(),
        })
        .map_err(|e| ApiError::internal_error(format!("Processor setup failed: {}", e)))?;
        let processor = Arc::new(processor);

        let state = AppState {
            publisher,
            reads,
            dead_letters: backends.dead_letters,
            cache,
            metrics: processor.metrics(),
            start_time: Instant::now(),
        };

        Ok(Self {
            state,
            processor,
            local_query,
            consumers_per_queue: config.consumers_per_queue,
        })
    }

    pub fn router(&self) -> Router {
        routes::create_router(self.state.clone())
    }

    pub fn grpc_service(&self) -> EntityQueryServer<EntityQueryService> {
        grpc::create_service(self.local_query.clone(), self.state.publisher.clone())
    }

    /// Start the processor's consumers. They stop once `shutdown` is true.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.processor.spawn_workers(self.consumers_per_queue, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::EntityFields;
    use std::time::Duration;

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let config = PantryConfig {
            broker_poll_interval: Duration::from_millis(5),
            ..PantryConfig::default()
        };
        let runtime = Runtime::build(&config, Backends::in_memory(&config)).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = runtime.spawn_workers(shutdown_rx);
        assert_eq!(workers.len(), 3 * config.consumers_per_queue);

        let accepted = runtime
            .state
            .publisher
            .create(None, EntityFields::new("Soup", "water,salt", 10))
            .await
            .unwrap();

        let reads = runtime.state.reads.clone();
        wait_for(|| {
            let reads = reads.clone();
            async move { reads.get_one(accepted.entity_id).await.is_ok() }
        })
        .await;

        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_lmdb_backends_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = PantryConfig {
            data_dir: Some(dir.path().to_path_buf()),
            lmdb_max_size_mb: 16,
            ..PantryConfig::default()
        };
        let backends = Backends::from_config(&config).unwrap();
        assert!(dir.path().join(STORE_DIR).exists());
        assert!(dir.path().join(BROKER_DIR).exists());
        assert!(dir.path().join(CACHE_DIR).exists());
        Runtime::build(&config, backends).unwrap();
    }
}
