//! CameraProxy data types

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Desired content category of a proxied fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    /// Continuous stream (MJPEG, relay, HLS)
    #[serde(alias = "mjpeg")]
    Stream,
    /// Single image
    #[serde(alias = "image")]
    Snapshot,
    /// Camera web-UI page or asset
    #[serde(alias = "asset", alias = "html")]
    Page,
}

impl ContentCategory {
    /// Category when the caller did not name one
    pub fn infer(has_asset: bool, upstream_content_type: Option<&str>) -> Self {
        if has_asset {
            return ContentCategory::Page;
        }
        let ct = upstream_content_type.unwrap_or_default().to_ascii_lowercase();
        if ct.starts_with("multipart/") || ct.starts_with("video/") || ct.contains("mpegurl") {
            ContentCategory::Stream
        } else if ct.starts_with("image/") {
            ContentCategory::Snapshot
        } else {
            ContentCategory::Page
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::Stream => "stream",
            ContentCategory::Snapshot => "snapshot",
            ContentCategory::Page => "page",
        }
    }
}

/// One proxy call as received from the browser
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyRequest {
    /// Camera page/stream URL
    pub url: Option<String>,
    /// Sub-resource path, resolved against `url`
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default, rename = "type")]
    pub category: Option<ContentCategory>,
    /// Request-scoped credentials (POST body only)
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Proxy failures, each with a stable local status
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Missing camera URL parameter")]
    MissingUrl,

    #[error("Invalid URL format")]
    InvalidUrl,

    #[error("Invalid protocol")]
    InvalidScheme,

    #[error("Camera IP not allowed")]
    HostNotAllowed,

    #[error("Authentication failed - check username and password")]
    AuthFailed,

    #[error("Access forbidden by camera")]
    UpstreamForbidden,

    #[error("Stream endpoint not found - check camera model and firmware")]
    EndpointNotFound,

    #[error("Camera service unavailable - device may be busy")]
    Unavailable,

    #[error("Camera responded with status {0}")]
    UpstreamStatus(u16),

    /// Redirects are relayed with their own status, never followed
    #[error("Camera redirected the request (status {0})")]
    Redirected(u16),

    #[error("Camera connection timeout")]
    Timeout,

    #[error("Failed to connect to camera: {0}")]
    Upstream(String),
}

impl ProxyError {
    /// Translate an upstream non-2xx status
    pub fn from_upstream_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => ProxyError::AuthFailed,
            403 => ProxyError::UpstreamForbidden,
            404 => ProxyError::EndpointNotFound,
            503 => ProxyError::Unavailable,
            code if status.is_client_error() || status.is_server_error() => {
                ProxyError::UpstreamStatus(code)
            }
            code => ProxyError::Redirected(code),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingUrl | ProxyError::InvalidUrl | ProxyError::InvalidScheme => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::HostNotAllowed => StatusCode::FORBIDDEN,
            ProxyError::AuthFailed => StatusCode::UNAUTHORIZED,
            ProxyError::UpstreamForbidden => StatusCode::FORBIDDEN,
            ProxyError::EndpointNotFound => StatusCode::NOT_FOUND,
            ProxyError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamStatus(code) | ProxyError::Redirected(code) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rejected before any outbound request
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ProxyError::MissingUrl
                | ProxyError::InvalidUrl
                | ProxyError::InvalidScheme
                | ProxyError::HostNotAllowed
        )
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status(), Json(json!({ "error": self.to_string() }))).into_response();
        no_store(response.headers_mut());
        allow_embedding(response.headers_mut());
        response
    }
}

/// Proxied body: buffered, or relayed chunk by chunk
pub enum ProxyBody {
    Bytes(Bytes),
    Stream(reqwest::Response),
}

impl std::fmt::Debug for ProxyBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            ProxyBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Successful proxy result
#[derive(Debug)]
pub struct ProxyResponse {
    pub category: ContentCategory,
    pub content_type: String,
    pub body: ProxyBody,
}

/// `Cache-Control: no-store` family for live content
pub fn no_store(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

/// Frame-embedding permission, on every proxy response
pub fn allow_embedding(headers: &mut HeaderMap) {
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("ALLOWALL"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
}

/// Permissive-but-explicit CORS: echo the caller origin, else `*`
pub fn apply_cors(headers: &mut HeaderMap, origin: Option<&HeaderValue>) {
    match origin {
        Some(origin) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
        None => {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        }
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        headers.insert(header::CONTENT_TYPE, content_type);
        allow_embedding(&mut headers);
        match self.category {
            ContentCategory::Stream | ContentCategory::Snapshot => no_store(&mut headers),
            ContentCategory::Page => {
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            }
        }

        let body = match self.body {
            ProxyBody::Bytes(bytes) => Body::from(bytes),
            ProxyBody::Stream(upstream) => Body::from_stream(upstream.bytes_stream()),
        };

        (StatusCode::OK, headers, body).into_response()
    }
}

/// Result of an authenticated reachability probe
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}
