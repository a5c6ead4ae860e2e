//! Entity REST API Routes
//!
//! Reads go through the read orchestrator. Mutations are published as
//! commands and answered with `202 Accepted`; the change becomes visible once
//! the processor has applied it.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::{
    error::{ApiError, ApiResult},
    publisher::CommandPublisher,
    read::ReadOrchestrator,
    state::AppState,
    types::{AcceptedResponse, CreateEntityRequest, EntityResponse, UpdateEntityRequest},
};

fn parse_path_id(raw: &str) -> ApiResult<pantry_core::EntityId> {
    Ok(pantry_core::parse_entity_id(raw)?)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::invalid_input(rejection.body_text()))
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// GET /entities - List all entities
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/entities",
    tag = "Entities",
    responses(
        (status = 200, description = "All entities in insertion order", body = Vec<EntityResponse>),
        (status = 503, description = "Query service unavailable", body = ApiError),
        (status = 504, description = "Query service timed out", body = ApiError),
    ),
))]
pub async fn list_entities(State(reads): State<ReadOrchestrator>) -> ApiResult<impl IntoResponse> {
    let entities = reads.list_all().await?;
    let response: Vec<EntityResponse> = entities.into_iter().map(EntityResponse::from).collect();
    Ok(Json(response))
}

/// GET /entities/{id} - Get one entity
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/entities/{id}",
    tag = "Entities",
    params(
        ("id" = String, Path, description = "Entity ID")
    ),
    responses(
        (status = 200, description = "Entity details", body = EntityResponse),
        (status = 400, description = "Malformed id", body = ApiError),
        (status = 404, description = "Entity not found", body = ApiError),
        (status = 504, description = "Query service timed out", body = ApiError),
    ),
))]
pub async fn get_entity(
    State(reads): State<ReadOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_path_id(&id)?;
    let entity = reads.get_one(id).await?;
    Ok(Json(EntityResponse::from(entity)))
}

/// POST /entities - Submit a create command
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/entities",
    tag = "Entities",
    request_body = CreateEntityRequest,
    responses(
        (status = 202, description = "Command accepted", body = AcceptedResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 503, description = "Broker unavailable", body = ApiError),
    ),
))]
pub async fn create_entity(
    State(publisher): State<Arc<CommandPublisher>>,
    payload: Result<Json<CreateEntityRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let (id, fields) = body(payload)?.into_parts()?;
    let acceptance = publisher.create(id, fields).await?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::from(acceptance))))
}

/// PUT /entities/{id} - Submit an update command
#[cfg_attr(feature = "openapi", utoipa::path(
    put,
    path = "/entities/{id}",
    tag = "Entities",
    params(
        ("id" = String, Path, description = "Entity ID")
    ),
    request_body = UpdateEntityRequest,
    responses(
        (status = 202, description = "Command accepted", body = AcceptedResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 503, description = "Broker unavailable", body = ApiError),
    ),
))]
pub async fn update_entity(
    State(publisher): State<Arc<CommandPublisher>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateEntityRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_path_id(&id)?;
    let fields = body(payload)?.into_fields()?;
    let acceptance = publisher.update(id, fields).await?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::from(acceptance))))
}

/// DELETE /entities/{id} - Submit a delete command
///
/// Accepted whether or not the entity exists; deleting an absent id is a
/// no-op once applied.
#[cfg_attr(feature = "openapi", utoipa::path(
    delete,
    path = "/entities/{id}",
    tag = "Entities",
    params(
        ("id" = String, Path, description = "Entity ID")
    ),
    responses(
        (status = 202, description = "Command accepted", body = AcceptedResponse),
        (status = 400, description = "Malformed id", body = ApiError),
        (status = 503, description = "Broker unavailable", body = ApiError),
    ),
))]
pub async fn delete_entity(
    State(publisher): State<Arc<CommandPublisher>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_path_id(&id)?;
    let acceptance = publisher.delete(id).await?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::from(acceptance))))
}

// ============================================================================
// ROUTER SETUP
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_entities).post(create_entity))
        .route("/:id", get(get_entity).put(update_entity).delete(delete_entity))
}
