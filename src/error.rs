//! Error handling for Gate Camserver

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (duplicate, state mismatch)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Durable storage failure (never swallowed: blocks cursor advancement)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream camera or backend returned something unusable
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Camera proxy rejection or upstream failure
    #[error("Camera proxy error: {0}")]
    Proxy(#[from] crate::camera_proxy::ProxyError),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Error::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Error::Serialization(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Error::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            Error::Proxy(e) => (e.status(), e.to_string()),
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Error::Parse(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Sqlx(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        tracing::error!(
            status = %status,
            message = %message,
            "Request error"
        );

        (status, Json(json!({ "error": message }))).into_response()
    }
}
