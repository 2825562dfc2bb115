//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::camera_proxy::no_store;
use crate::detection_source::CameraDetectionSource;
use crate::error::{Error, Result};
use crate::gate_registry::{GateId, RtspStream};
use crate::models::ApiResponse;
use crate::passage_client::ConfirmRequest;
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Gates
        .route("/api/gates", get(list_gates))
        .route("/api/gates/:gate_id", get(get_gate))
        .route("/api/gates/:gate_id/camera/rtsp-url", get(get_rtsp_url))
        // Detections (device log relay)
        .route("/api/camera-detections", get(get_camera_detections))
        // Pending queue (operator resolution)
        .route("/api/gates/:gate_id/pending", get(list_pending))
        .route("/api/gates/:gate_id/pending/next", get(next_pending))
        .route(
            "/api/gates/:gate_id/pending/:detection_id/vehicle-type",
            put(set_vehicle_type),
        )
        .route(
            "/api/gates/:gate_id/pending/:detection_id/confirm",
            post(confirm_pending),
        )
        .route(
            "/api/gates/:gate_id/pending/:detection_id/discard",
            post(discard_pending),
        )
        // Polling control
        .route("/api/gates/:gate_id/poll", post(trigger_poll))
        .route("/api/gates/:gate_id/polling", get(polling_status))
        .route("/api/visibility", post(set_visibility))
        // Stream sessions
        .route(
            "/api/surfaces/:surface_id/stream",
            get(stream_status).post(start_stream).delete(stop_stream),
        )
        .route("/api/surfaces/:surface_id/frame", get(surface_frame))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Gates
// ========================================

async fn list_gates(State(state): State<AppState>) -> impl IntoResponse {
    let gates: Vec<_> = state.gates.all().cloned().collect();
    Json(ApiResponse::success(gates))
}

async fn get_gate(
    State(state): State<AppState>,
    Path(gate_id): Path<GateId>,
) -> Result<impl IntoResponse> {
    let gate = state.gates.require(gate_id)?.clone();
    Ok(Json(ApiResponse::success(gate)))
}

#[derive(Debug, Deserialize)]
struct RtspQuery {
    stream: Option<RtspStream>,
}

async fn get_rtsp_url(
    State(state): State<AppState>,
    Path(gate_id): Path<GateId>,
    Query(query): Query<RtspQuery>,
) -> Result<impl IntoResponse> {
    let (_, camera) = state.gates.require_camera(gate_id)?;
    let stream = query.stream.unwrap_or(RtspStream::Main);
    let url = camera.rtsp_url(stream, state.proxy.default_credentials());

    Ok(Json(ApiResponse::success(json!({
        "gate_id": gate_id,
        "stream": match stream {
            RtspStream::Main => "main",
            RtspStream::Sub => "sub",
        },
        "url": url,
    }))))
}

#[derive(Debug, Deserialize)]
struct CameraDetectionsQuery {
    gate_id: GateId,
}

/// Raw device detection log, fetched through the camera proxy
async fn get_camera_detections(
    State(state): State<AppState>,
    Query(query): Query<CameraDetectionsQuery>,
) -> Result<impl IntoResponse> {
    let (_, camera) = state.gates.require_camera(query.gate_id)?;
    let source = CameraDetectionSource::new(state.proxy.clone());
    let batch = source.fetch_raw(camera).await?;

    let mut response = Json(batch).into_response();
    no_store(response.headers_mut());
    Ok(response)
}

// ========================================
// Pending Queue
// ========================================

async fn list_pending(
    State(state): State<AppState>,
    Path(gate_id): Path<GateId>,
) -> Result<impl IntoResponse> {
    state.gates.require(gate_id)?;
    let entries = state.detections.pending(gate_id).await?;
    Ok(Json(ApiResponse::success(entries)))
}

async fn next_pending(
    State(state): State<AppState>,
    Path(gate_id): Path<GateId>,
) -> Result<impl IntoResponse> {
    state.gates.require(gate_id)?;
    let next = state.detections.next_pending(gate_id).await?;
    Ok(Json(ApiResponse::success(next)))
}

#[derive(Debug, Deserialize)]
struct VehicleTypeRequest {
    vehicle_type_id: i64,
}

async fn set_vehicle_type(
    State(state): State<AppState>,
    Path((gate_id, detection_id)): Path<(GateId, u64)>,
    Json(req): Json<VehicleTypeRequest>,
) -> Result<impl IntoResponse> {
    let entry = state
        .detections
        .set_vehicle_type(gate_id, detection_id, req.vehicle_type_id)
        .await?;
    Ok(Json(ApiResponse::success(entry)))
}

async fn confirm_pending(
    State(state): State<AppState>,
    Path((gate_id, detection_id)): Path<(GateId, u64)>,
    Json(req): Json<ConfirmRequest>,
) -> Result<impl IntoResponse> {
    let (entry, passage) = state
        .detections
        .confirm(gate_id, detection_id, &req, &state.passages)
        .await?;

    Ok(Json(ApiResponse::success(json!({
        "detection": entry,
        "passage": passage,
    }))))
}

async fn discard_pending(
    State(state): State<AppState>,
    Path((gate_id, detection_id)): Path<(GateId, u64)>,
) -> Result<impl IntoResponse> {
    let entry = state.detections.discard(gate_id, detection_id).await?;
    Ok(Json(ApiResponse::success(entry)))
}

// ========================================
// Polling Control
// ========================================

/// Immediate poll. Supersedes an in-flight poll when the gate's poller runs;
/// otherwise polls once inline.
async fn trigger_poll(
    State(state): State<AppState>,
    Path(gate_id): Path<GateId>,
) -> Result<Response> {
    let gate = state.gates.require(gate_id)?;

    match state.detections.trigger(gate_id).await {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(json!({ "gate_id": gate_id, "triggered": true }))),
        )
            .into_response()),
        Err(Error::NotFound(_)) => {
            let outcome = state.detections.poll_once(gate).await?;
            Ok(Json(ApiResponse::success(outcome)).into_response())
        }
        Err(e) => Err(e),
    }
}

async fn polling_status(
    State(state): State<AppState>,
    Path(gate_id): Path<GateId>,
) -> Result<impl IntoResponse> {
    state.gates.require(gate_id)?;
    let status = state.detections.status(gate_id).await?;
    Ok(Json(ApiResponse::success(status)))
}

#[derive(Debug, Deserialize)]
struct VisibilityRequest {
    visible: bool,
}

/// Page visibility: hidden pauses pollers and ends stream sessions
async fn set_visibility(
    State(state): State<AppState>,
    Json(req): Json<VisibilityRequest>,
) -> impl IntoResponse {
    state.detections.set_visible(req.visible);

    let streams_stopped = if req.visible {
        0
    } else {
        state.streams.stop_all().await
    };

    tracing::info!(
        visible = req.visible,
        streams_stopped = streams_stopped,
        "Page visibility changed"
    );

    Json(ApiResponse::success(json!({
        "visible": state.detections.is_visible(),
        "pollers_running": state.detections.running_gates().await.len(),
        "streams_stopped": streams_stopped,
    })))
}

// ========================================
// Stream Sessions
// ========================================

#[derive(Debug, Deserialize)]
struct StartStreamRequest {
    gate_id: GateId,
}

async fn start_stream(
    State(state): State<AppState>,
    Path(surface_id): Path<String>,
    Json(req): Json<StartStreamRequest>,
) -> Result<impl IntoResponse> {
    let (_, camera) = state.gates.require_camera(req.gate_id)?;
    let session = state
        .streams
        .start(&surface_id, Some(req.gate_id), camera.clone())
        .await;

    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(session))))
}

async fn stop_stream(
    State(state): State<AppState>,
    Path(surface_id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = state
        .streams
        .stop(&surface_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("no stream session on surface {}", surface_id)))?;
    Ok(Json(ApiResponse::success(session)))
}

async fn stream_status(
    State(state): State<AppState>,
    Path(surface_id): Path<String>,
) -> Result<impl IntoResponse> {
    let status = state
        .streams
        .status(&surface_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("no stream session on surface {}", surface_id)))?;
    Ok(Json(ApiResponse::success(status)))
}

/// Latest frame attached to a server-side surface
async fn surface_frame(
    State(state): State<AppState>,
    Path(surface_id): Path<String>,
) -> Result<Response> {
    let source = state
        .streams
        .latest_frame(&surface_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("nothing attached to surface {}", surface_id)))?;
    let frame = source
        .frame
        .ok_or_else(|| Error::NotFound(format!("no decoded frame for {}", source.url)))?;

    let mut headers = HeaderMap::new();
    let content_type = if source.content_type.starts_with("image/") {
        source.content_type.as_str()
    } else {
        "image/jpeg"
    };
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type).unwrap_or(HeaderValue::from_static("image/jpeg")),
    );
    no_store(&mut headers);

    Ok((StatusCode::OK, headers, frame).into_response())
}

// ========================================
// WebSocket
// ========================================

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Register with RealtimeHub
    let (conn_id, mut rx) = state.realtime.register().await;

    // Forward hub messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Clients only ping and close
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Ping(data)) => {
                    tracing::trace!("Received ping: {:?}", data);
                }
                Ok(Message::Close(_)) => {
                    tracing::info!(connection_id = %conn_id, "WebSocket client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
        conn_id
    });

    let conn_id = tokio::select! {
        _ = send_task => conn_id,
        result = recv_task => result.unwrap_or(conn_id),
    };

    state.realtime.unregister(&conn_id).await;
}
