//! Health Check Endpoint
//!
//! `GET /health` reports uptime plus the in-process processor and cache
//! counters. There is no external metrics backend; this is the only place
//! the counters are exposed.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::processor::ProcessorMetricsSnapshot;
use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// The read cache is unreachable. Reads still work, uncached.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CacheHealth {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub hit_rate: f64,
}

/// Health check response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub processor: ProcessorMetricsSnapshot,
    /// Absent while the cache is unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheHealth>,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health - Service health and counters
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse),
    ),
))]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let cache = match state.cache.stats().await {
        Ok(stats) => Some(CacheHealth {
            hits: stats.hits,
            misses: stats.misses,
            entries: stats.entry_count,
            hit_rate: stats.hit_rate(),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Cache stats unavailable");
            None
        }
    };

    let status = if cache.is_some() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        processor: state.metrics.snapshot(),
        cache,
    })
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", get(health))
}
