//! PANTRY API - Command/Query Service Layer
//!
//! Mutations are validated and published as commands; a processor applies
//! them to the entity store in the background. Reads are served cache-aside
//! from a query service over the same store. Both sides are exposed over
//! REST (Axum) and gRPC (Tonic).

pub mod config;
pub mod constants;
pub mod error;
pub mod grpc;
pub mod macros;
#[cfg(feature = "openapi")]
pub mod openapi;
pub mod processor;
pub mod publisher;
pub mod query;
pub mod read;
pub mod routes;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use config::{LogFormat, PantryConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use grpc::{create_service, proto, EntityQueryService, GrpcQueryClient};
#[cfg(feature = "openapi")]
pub use openapi::ApiDoc;
pub use processor::{CommandProcessor, ProcessorDeps, ProcessorMetrics, ProcessorMetricsSnapshot};
pub use publisher::{Acceptance, CommandPublisher};
pub use query::{QueryService, StoreQueryService};
pub use read::ReadOrchestrator;
pub use routes::create_router;
pub use runtime::{Backends, Runtime};
pub use state::AppState;
pub use types::*;
