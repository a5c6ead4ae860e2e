//! REST API Routes Module
//!
//! - `/entities` reads and command submission
//! - `/dead-letters` inspection and replay
//! - `/health` uptime and counters
//! - `/openapi.json` with the `openapi` feature

pub mod dead_letter;
pub mod entity;
pub mod health;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Handler for /openapi.json endpoint.
#[cfg(feature = "openapi")]
async fn openapi_json() -> impl axum::response::IntoResponse {
    use utoipa::OpenApi;
    axum::Json(crate::openapi::ApiDoc::openapi())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_origin(Any)
}

/// Build the complete REST router.
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .nest("/entities", entity::create_router())
        .nest("/dead-letters", dead_letter::create_router())
        .nest("/health", health::create_router());

    #[cfg(feature = "openapi")]
    let router = router.route("/openapi.json", axum::routing::get(openapi_json));

    router
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(state)
}
