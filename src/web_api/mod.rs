//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Camera proxy gateway routes (own CORS handling)
//! - Gate, pending queue and polling control routes
//! - Stream session routes and WebSocket distribution

mod proxy_routes;
mod routes;

pub use proxy_routes::proxy_routes;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::models::HealthResponse;
use crate::state::AppState;

/// Full application router: API routes behind a CORS layer, proxy routes as-is
pub fn create_router(state: AppState) -> Router {
    routes::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .merge(proxy_routes(state))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        gates: state.gates.len(),
        pollers_running: state.detections.running_gates().await.len(),
    };

    Json(response)
}
