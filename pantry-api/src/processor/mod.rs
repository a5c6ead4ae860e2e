//! Command Processor
//!
//! The apply side of the write path: a registration table from routing key
//! to handler, a per-entity sequencer, the state machine that settles each
//! delivery, and the observers told about every committed change.

pub mod engine;
pub mod handlers;
pub mod metrics;
pub mod observer;
pub mod registry;
pub mod sequencer;

pub use engine::{CommandProcessor, ProcessorDeps};
pub use handlers::{
    ApplyError, ApplyOutcome, CommandHandler, CreateHandler, DeleteHandler, UpdateHandler,
};
pub use metrics::{ProcessorMetrics, ProcessorMetricsSnapshot};
pub use observer::{ApplyObserver, CacheInvalidator};
pub use registry::{HandlerRegistry, RegistryError};
pub use sequencer::{KeyGuard, KeySequencer};
