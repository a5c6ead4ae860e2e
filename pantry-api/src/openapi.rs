//! OpenAPI Specification for PANTRY API
//!
//! Generated by utoipa from the route annotations and response types.

use utoipa::OpenApi;

use crate::error::{ApiError, ErrorCode};
use crate::processor::ProcessorMetricsSnapshot;
use crate::routes::health::{CacheHealth, HealthResponse, HealthStatus};
use crate::routes::{dead_letter, entity, health};
use crate::types::*;

/// OpenAPI document for the PANTRY REST surface.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "PANTRY API",
        description = "Recipe catalog with an asynchronous command write path and a cached read path",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local Development")
    ),
    tags(
        (name = "Entities", description = "Catalog reads and command submission"),
        (name = "Dead Letters", description = "Commands that could not be applied"),
        (name = "Health", description = "Uptime and in-process counters")
    ),
    paths(
        entity::list_entities,
        entity::get_entity,
        entity::create_entity,
        entity::update_entity,
        entity::delete_entity,
        dead_letter::list_dead_letters,
        dead_letter::replay_dead_letter,
        health::health,
    ),
    components(schemas(
        ApiError,
        ErrorCode,
        CreateEntityRequest,
        UpdateEntityRequest,
        EntityResponse,
        AcceptedResponse,
        DeadLetterResponse,
        ListDeadLettersResponse,
        HealthResponse,
        HealthStatus,
        CacheHealth,
        ProcessorMetricsSnapshot,
    ))
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Serialize the document as pretty-printed JSON.
    pub fn to_json() -> Result<String, serde_json::Error> {
        Self::openapi().to_pretty_json()
    }
}
