mod common;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use gate_camserver::camera_proxy::CameraProxy;
use gate_camserver::gate_registry::{CameraDevice, GateConfig};
use gate_camserver::state::ProxyConfig;
use gate_camserver::stream_session::{
    MjpegTransport, SnapshotTransport, StreamError, StreamProtocol, StreamTransport,
};
use gate_camserver::web_api;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const PAGE: &str = r#"<html><head><link rel="stylesheet" href="/style.css"></head><body><img src="logo.png"><a href="http://elsewhere.example/x">x</a></body></html>"#;

async fn count_hits(
    State(hits): State<Arc<AtomicUsize>>,
    request: Request,
    next: Next,
) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    next.run(request).await
}

async fn authorization_echo(headers: HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

const MJPEG_FRAME: [u8; 6] = [0xFF, 0xD8, 0x10, 0x20, 0xFF, 0xD9];

async fn mjpeg() -> Response {
    let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
    body.extend_from_slice(&MJPEG_FRAME);
    body.extend_from_slice(b"\r\n--frame\r\n");
    (
        [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
        body,
    )
        .into_response()
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(3)).await;
    "late"
}

async fn snapshot(headers: HeaderMap) -> Response {
    if !headers.contains_key(header::AUTHORIZATION) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        [(header::CONTENT_TYPE, "image/jpeg")],
        vec![0xFFu8, 0xD8, 0x00, 0xFF, 0xD9],
    )
        .into_response()
}

/// Fake camera; returns its address and a request counter
async fn fake_camera() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/page",
            get(|| async { ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], PAGE) }),
        )
        .route("/secure", get(|| async { StatusCode::UNAUTHORIZED }))
        .route("/whoami", get(authorization_echo))
        .route("/snapshot.jpg", get(snapshot))
        .route("/cgi-bin/mjpeg", get(mjpeg))
        .route("/slow", get(slow))
        .route(
            "/broken",
            get(|| async { (StatusCode::BAD_GATEWAY, "encoder crashed") }),
        )
        .route(
            "/busy",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        )
        .route(
            "/moved",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/page")]) }),
        )
        .route(
            "/edge/cgi-bin/vparcgi.cgi",
            get(|| async {
                axum::Json(json!([
                    { "id": 7, "numberplate": "ab-123", "direction": 0 },
                    { "id": 8, "numberplate": "cd-456", "direction": 1 }
                ]))
            }),
        )
        .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

    (common::spawn_server(router).await, hits)
}

fn camera_at(addr: SocketAddr) -> CameraDevice {
    let mut camera = CameraDevice::new(addr.ip().to_string());
    camera.http_port = addr.port();
    camera.snapshot_path = "/snapshot.jpg".to_string();
    camera
}

fn gateway(allowlist: &[&str], camera_addr: Option<SocketAddr>) -> Router {
    let gates = match camera_addr {
        Some(addr) => vec![GateConfig::new(1, "North entry").with_camera(camera_at(addr))],
        None => Vec::new(),
    };
    gateway_with(common::proxy_config(allowlist), gates)
}

fn gateway_with(proxy: ProxyConfig, gates: Vec<GateConfig>) -> Router {
    let state = common::app_state(
        proxy,
        gates,
        common::ScriptedSource::new(),
        "http://127.0.0.1:1",
    );
    web_api::create_router(state)
}

fn json_request(method: Method, uri: &str, body: Value) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: Router, request: axum::http::Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

fn get_request(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn proxy_uri(target: &str) -> String {
    format!("/camera-proxy?url={}", urlencoding::encode(target))
}

#[tokio::test]
async fn test_host_outside_allowlist_is_never_contacted() {
    let (addr, hits) = fake_camera().await;
    let router = gateway(&["10.0.0.1"], None);

    let (status, headers, body) =
        send(router, get_request(&proxy_uri(&format!("http://{}/page", addr)))).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "error": "Camera IP not allowed" }));
    assert!(headers[header::CACHE_CONTROL]
        .to_str()
        .unwrap()
        .contains("no-store"));
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_requests_are_bad_requests() {
    let cases = [
        ("/camera-proxy".to_string(), "Missing camera URL parameter"),
        (proxy_uri("not a url"), "Invalid URL format"),
        (proxy_uri("ftp://127.0.0.1/x"), "Invalid protocol"),
    ];

    for (uri, message) in cases {
        let (status, _, body) = send(gateway(&["127.0.0.1"], None), get_request(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], message);
    }
}

#[tokio::test]
async fn test_upstream_401_is_reported_as_auth_failure() {
    let (addr, hits) = fake_camera().await;
    let router = gateway(&["127.0.0.1"], None);

    let (status, _, body) =
        send(router, get_request(&proxy_uri(&format!("http://{}/secure", addr)))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        body["error"],
        "Authentication failed - check username and password"
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_html_asset_references_point_back_to_proxy() {
    let (addr, _) = fake_camera().await;
    let router = gateway(&["127.0.0.1"], None);
    let page_url = format!("http://{}/page", addr);

    let (status, headers, body) = send(router, get_request(&proxy_uri(&page_url))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));

    let html = String::from_utf8(body).unwrap();
    let encoded_page = urlencoding::encode(&page_url).into_owned();
    assert!(html.contains(&format!(
        "/camera-proxy?url={}&asset=%2Fstyle.css",
        encoded_page
    )));
    assert!(html.contains(&format!("/camera-proxy?url={}&asset=logo.png", encoded_page)));
    assert!(html.contains(r#"href="http://elsewhere.example/x""#));
    assert!(!html.contains(r#"href="/style.css""#));
}

#[tokio::test]
async fn test_request_credentials_override_defaults() {
    let (addr, _) = fake_camera().await;
    let target = format!("http://{}/whoami", addr);

    let (_, _, body) = send(
        gateway(&["127.0.0.1"], None),
        get_request(&proxy_uri(&target)),
    )
    .await;
    assert_eq!(String::from_utf8(body).unwrap(), "Basic YWRtaW46c2VjcmV0");

    let request = axum::http::Request::builder()
        .method(Method::POST)
        .uri("/camera-proxy")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "url": target, "username": "operator", "password": "pw" }).to_string(),
        ))
        .unwrap();
    let (status, _, body) = send(gateway(&["127.0.0.1"], None), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "Basic b3BlcmF0b3I6cHc=");
}

#[tokio::test]
async fn test_camera_stream_snapshot_shortcut() {
    let (addr, _) = fake_camera().await;
    let router = gateway(&["127.0.0.1"], Some(addr));
    let (status, headers, body) =
        send(router, get_request("/camera-stream/1?type=snapshot")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
    assert!(headers[header::CACHE_CONTROL]
        .to_str()
        .unwrap()
        .contains("no-store"));
    assert_eq!(body, vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9]);
}

#[tokio::test]
async fn test_unknown_gate_and_stream_type() {
    let (addr, _) = fake_camera().await;

    let (status, _, _) = send(
        gateway(&["127.0.0.1"], Some(addr)),
        get_request("/camera-stream/9"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(
        gateway(&["127.0.0.1"], Some(addr)),
        get_request("/camera-stream/1?type=thermal"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_preflight_echoes_origin() {
    let request = axum::http::Request::builder()
        .method(Method::OPTIONS)
        .uri("/camera-proxy")
        .header(header::ORIGIN, "http://dashboard.local")
        .body(Body::empty())
        .unwrap();

    let (status, headers, _) = send(gateway(&[], None), request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://dashboard.local"
    );
    assert!(headers[header::ACCESS_CONTROL_ALLOW_METHODS]
        .to_str()
        .unwrap()
        .contains("OPTIONS"));
}

#[tokio::test]
async fn test_camera_detection_relay() {
    let (addr, _) = fake_camera().await;
    let router = gateway(&["127.0.0.1"], Some(addr));

    let (status, _, body) = send(router, get_request("/api/camera-detections?gate_id=1")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["numberplate"], "ab-123");
}

#[tokio::test]
async fn test_upstream_timeout_is_gateway_timeout() {
    let (addr, _) = fake_camera().await;
    let mut config = common::proxy_config(&["127.0.0.1"]);
    config.timeout = Duration::from_millis(200);

    let (status, headers, body) = send(
        gateway_with(config, Vec::new()),
        get_request(&proxy_uri(&format!("http://{}/slow", addr))),
    )
    .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "Camera connection timeout");
    assert_eq!(headers[header::X_FRAME_OPTIONS], "ALLOWALL");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn test_upstream_error_status_is_relayed() {
    let (addr, hits) = fake_camera().await;
    let cases = [
        ("/broken", StatusCode::BAD_GATEWAY, "Camera responded with status 502"),
        (
            "/busy",
            StatusCode::SERVICE_UNAVAILABLE,
            "Camera service unavailable - device may be busy",
        ),
        (
            "/moved",
            StatusCode::FOUND,
            "Camera redirected the request (status 302)",
        ),
    ];

    for (path, expected, message) in cases {
        let (status, headers, body) = send(
            gateway(&["127.0.0.1"], None),
            get_request(&proxy_uri(&format!("http://{}{}", addr, path))),
        )
        .await;
        assert_eq!(status, expected, "{}", path);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], message);
        assert_eq!(headers[header::X_FRAME_OPTIONS], "ALLOWALL");
    }

    // the redirect was relayed, not followed to /page
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_mjpeg_and_snapshot_transports_against_camera() {
    let (addr, _) = fake_camera().await;
    let proxy = Arc::new(CameraProxy::new(common::proxy_config(&["127.0.0.1"])));
    let camera = camera_at(addr);

    let mjpeg = MjpegTransport::new(proxy.clone());
    let media = mjpeg.open(&camera).await.unwrap();
    assert_eq!(media.protocol, StreamProtocol::Mjpeg);
    assert_eq!(media.frame.as_deref(), Some(&MJPEG_FRAME[..]));
    assert!(media.url.starts_with("/camera-proxy?url="));
    assert!(media.url.ends_with("&type=stream"));

    let snapshots = SnapshotTransport::new(proxy.clone(), Duration::from_millis(500));
    let media = snapshots.open(&camera).await.unwrap();
    assert_eq!(media.protocol, StreamProtocol::Snapshot);
    assert_eq!(media.content_type, "image/jpeg");
    assert_eq!(
        media.frame.as_deref(),
        Some(&[0xFFu8, 0xD8, 0x00, 0xFF, 0xD9][..])
    );
    assert_eq!(snapshots.refresh_interval(), Some(Duration::from_millis(500)));
}

#[tokio::test]
async fn test_transports_report_camera_failures() {
    let (addr, hits) = fake_camera().await;
    let proxy = Arc::new(CameraProxy::new(common::proxy_config(&["127.0.0.1"])));

    let mut camera = camera_at(addr);
    camera.mjpeg_path = "/secure".to_string();
    camera.snapshot_path = "/page".to_string();

    match MjpegTransport::new(proxy.clone()).open(&camera).await {
        Err(StreamError::Transport(message)) => {
            assert!(message.contains("Authentication failed"), "{}", message)
        }
        other => panic!("unexpected {:?}", other.map(|m| m.protocol)),
    }
    match SnapshotTransport::new(proxy, Duration::from_millis(500))
        .open(&camera)
        .await
    {
        Err(StreamError::Transport(message)) => assert!(message.contains("not an image")),
        other => panic!("unexpected {:?}", other.map(|m| m.protocol)),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let outside = Arc::new(CameraProxy::new(common::proxy_config(&["10.0.0.1"])));
    assert!(MjpegTransport::new(outside).open(&camera).await.is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_hidden_page_stops_stream_sessions() {
    let (addr, _) = fake_camera().await;
    let mut camera = camera_at(addr);
    camera.supports_mjpeg = false;
    let router = gateway_with(
        common::proxy_config(&["127.0.0.1"]),
        vec![GateConfig::new(1, "North entry").with_camera(camera)],
    );

    let (status, _, _) = send(
        router.clone(),
        json_request(Method::POST, "/api/surfaces/kiosk/stream", json!({ "gate_id": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut state = Value::Null;
    for _ in 0..100 {
        let (_, _, body) = send(router.clone(), get_request("/api/surfaces/kiosk/stream")).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        state = body["data"]["state"].clone();
        if state == "live" {
            assert_eq!(body["data"]["protocol"], "snapshot");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, "live");

    let (status, _, body) = send(
        router.clone(),
        json_request(Method::POST, "/api/visibility", json!({ "visible": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["data"]["visible"], false);
    assert_eq!(body["data"]["streams_stopped"], 1);

    let (_, _, body) = send(router, get_request("/api/surfaces/kiosk/stream")).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["data"]["state"], "stopped");
}
