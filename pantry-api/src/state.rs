//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use pantry_broker::DeadLetterStore;
use pantry_storage::cache::ReadCache;

use crate::processor::ProcessorMetrics;
use crate::publisher::CommandPublisher;
use crate::read::ReadOrchestrator;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Write side: every mutation goes through here.
    pub publisher: Arc<CommandPublisher>,
    /// Read side: cache first, query service on a miss.
    pub reads: ReadOrchestrator,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    /// Only read for statistics; routes never write it directly.
    pub cache: ReadCache,
    pub metrics: Arc<ProcessorMetrics>,
    pub start_time: Instant,
}

crate::impl_from_ref!(Arc<CommandPublisher>, publisher);
crate::impl_from_ref!(ReadOrchestrator, reads);
crate::impl_from_ref!(Arc<dyn DeadLetterStore>, dead_letters);
