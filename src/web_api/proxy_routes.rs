//! Camera proxy routes
//!
//! CORS headers are set per response here, not by a layer: rejections and
//! preflights need them too.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::camera_proxy::{allow_embedding, apply_cors, ContentCategory, ProxyRequest};
use crate::error::Error;
use crate::gate_registry::GateId;
use crate::state::AppState;

/// Create camera proxy router
pub fn proxy_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/camera-proxy",
            get(proxy_get).post(proxy_post).options(preflight),
        )
        .route(
            "/api/camera-proxy",
            get(proxy_get).post(proxy_post).options(preflight),
        )
        .route("/camera-stream/:gate_id", get(camera_stream).options(preflight))
        .route(
            "/camera-stream/:gate_id/test",
            post(camera_stream_test).options(preflight),
        )
        .with_state(state)
}

fn with_cors(mut response: Response, headers: &HeaderMap) -> Response {
    apply_cors(response.headers_mut(), headers.get(header::ORIGIN));
    allow_embedding(response.headers_mut());
    response
}

async fn relay(state: &AppState, headers: &HeaderMap, request: ProxyRequest) -> Response {
    let response = match state.proxy.fetch(request).await {
        Ok(proxied) => proxied.into_response(),
        Err(e) => e.into_response(),
    };
    with_cors(response, headers)
}

async fn preflight(headers: HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    response.headers_mut().insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    with_cors(response, &headers)
}

/// GET: target in the query string; credentials always come from config
async fn proxy_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProxyRequest>,
) -> Response {
    let request = ProxyRequest {
        username: None,
        password: None,
        ..query
    };
    relay(&state, &headers, request).await
}

/// POST: JSON body may carry the target and request-scoped credentials
async fn proxy_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProxyRequest>,
    body: Bytes,
) -> Response {
    let posted: ProxyRequest = if body.is_empty() {
        ProxyRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(posted) => posted,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected proxy request body");
                let response = (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid request body" })),
                )
                    .into_response();
                return with_cors(response, &headers);
            }
        }
    };

    let request = ProxyRequest {
        url: posted.url.or(query.url),
        asset: posted.asset.or(query.asset),
        category: posted.category.or(query.category),
        username: posted.username,
        password: posted.password,
    };
    relay(&state, &headers, request).await
}

#[derive(Debug, Deserialize)]
struct CameraStreamQuery {
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Gate camera's MJPEG stream or snapshot, through the same gateway
async fn camera_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(gate_id): Path<GateId>,
    Query(query): Query<CameraStreamQuery>,
) -> Response {
    let camera = match state.gates.require_camera(gate_id) {
        Ok((_, camera)) => camera,
        Err(e) => return with_cors(e.into_response(), &headers),
    };

    let (url, category) = match query.kind.as_deref().unwrap_or("mjpeg") {
        "mjpeg" | "stream" => (camera.mjpeg_url(), ContentCategory::Stream),
        "snapshot" | "image" => (camera.snapshot_url(), ContentCategory::Snapshot),
        other => {
            let e = Error::Validation(format!("unknown stream type: {}", other));
            return with_cors(e.into_response(), &headers);
        }
    };

    let request = ProxyRequest {
        url: Some(url),
        asset: None,
        category: Some(category),
        username: camera.username.clone(),
        password: camera.password.clone(),
    };
    relay(&state, &headers, request).await
}

/// Authenticated HEAD probe against the gate camera
async fn camera_stream_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(gate_id): Path<GateId>,
) -> Response {
    let camera = match state.gates.require_camera(gate_id) {
        Ok((_, camera)) => camera,
        Err(e) => return with_cors(e.into_response(), &headers),
    };

    let credentials = camera.credentials(state.proxy.default_credentials());
    let result = state
        .proxy
        .test_connection(&camera.endpoint_url("/"), &credentials)
        .await;

    tracing::info!(
        gate_id = gate_id,
        success = result.success,
        status = ?result.status,
        "Camera connection test"
    );

    with_cors(Json(result).into_response(), &headers)
}
