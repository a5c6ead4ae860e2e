//! Dead-letter REST API Routes
//!
//! Operator view of commands that could not be applied, and replay of the
//! ones whose body still parses.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use pantry_broker::DeadLetterStore;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult, ErrorCode},
    publisher::CommandPublisher,
    state::AppState,
    types::{AcceptedResponse, DeadLetterResponse, ListDeadLettersResponse},
};

/// GET /dead-letters - List dead-lettered commands
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/dead-letters",
    tag = "Dead Letters",
    responses(
        (status = 200, description = "Dead-letter records, oldest first", body = ListDeadLettersResponse),
    ),
))]
pub async fn list_dead_letters(
    State(dead_letters): State<Arc<dyn DeadLetterStore>>,
) -> ApiResult<impl IntoResponse> {
    let records: Vec<DeadLetterResponse> = dead_letters
        .list()
        .await?
        .into_iter()
        .map(DeadLetterResponse::from)
        .collect();
    let total = records.len();
    Ok(Json(ListDeadLettersResponse { records, total }))
}

/// POST /dead-letters/{id}/replay - Publish a dead-lettered command again
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/dead-letters/{id}/replay",
    tag = "Dead Letters",
    params(
        ("id" = Uuid, Path, description = "Dead-letter record ID (the command id)")
    ),
    responses(
        (status = 202, description = "Command republished", body = AcceptedResponse),
        (status = 400, description = "Record body is not a readable command", body = ApiError),
        (status = 404, description = "Record not found", body = ApiError),
        (status = 503, description = "Broker unavailable", body = ApiError),
    ),
))]
pub async fn replay_dead_letter(
    State(dead_letters): State<Arc<dyn DeadLetterStore>>,
    State(publisher): State<Arc<CommandPublisher>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let record = dead_letters
        .get(id)
        .await?
        .ok_or_else(|| ApiError::dead_letter_not_found(id))?;

    let command = record.command.as_ref().ok_or_else(|| {
        ApiError::new(
            ErrorCode::SerializationFailed,
            format!("Dead-letter record {} has no readable command: {}", id, record.error),
        )
    })?;

    let acceptance = publisher.republish(command).await?;
    let record = dead_letters.mark_replayed(id).await?;

    tracing::info!(
        record_id = %id,
        entity_id = %acceptance.entity_id,
        routing_key = %acceptance.routing_key,
        replay_count = record.replay_count,
        "Dead-lettered command replayed"
    );

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::from(acceptance))))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:id/replay", post(replay_dead_letter))
}
