//! Application state
//!
//! Holds all shared components and the configuration they were built from.
//!
//! Configuration is read from the environment exactly once, in
//! `AppConfig::default()`. Components receive the sections they need at
//! construction. Override order everywhere: explicit request value, then
//! configured default.

use crate::camera_proxy::CameraProxy;
use crate::detection_poller::DetectionPollingEngine;
use crate::gate_registry::GateRegistry;
use crate::models::Credentials;
use crate::passage_client::PassageClient;
use crate::realtime_hub::RealtimeHub;
use crate::stream_session::StreamSessionController;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Camera proxy settings
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Hosts (IP or hostname) the proxy may reach
    pub allowlist: HashSet<String>,
    /// Upstream response-header timeout
    pub timeout: Duration,
    /// Injected when the request carries no credentials
    pub default_credentials: Credentials,
    /// Public path rewritten asset links point back to
    pub public_path: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let allowlist = env_or("CAMERA_ALLOWLIST", "")
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();

        Self {
            allowlist,
            timeout: Duration::from_secs(env_parse("PROXY_TIMEOUT_SEC", 15)),
            default_credentials: Credentials::new(
                env_or("CAMERA_USERNAME", "admin"),
                env_or("CAMERA_PASSWORD", ""),
            ),
            public_path: "/camera-proxy".to_string(),
        }
    }
}

/// Stream session settings
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Bounded wait for the first renderable frame of one attempt
    pub first_frame_timeout: Duration,
    /// Pause before advancing to the next protocol
    pub backoff: Duration,
    /// Full passes over the fallback chain before giving up
    pub max_passes: u32,
    /// Snapshot mode refresh period
    pub snapshot_interval: Duration,
    /// Consecutive snapshot refresh failures tolerated while live
    pub max_refresh_failures: u32,
    /// Optimized relay base URL; no relay step when unset
    pub relay_url: Option<String>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            first_frame_timeout: Duration::from_millis(env_parse(
                "STREAM_FIRST_FRAME_TIMEOUT_MS",
                8000,
            )),
            backoff: Duration::from_millis(env_parse("STREAM_BACKOFF_MS", 1000)),
            max_passes: env_parse("STREAM_MAX_PASSES", 3u32).max(1),
            snapshot_interval: Duration::from_millis(env_parse(
                "STREAM_SNAPSHOT_INTERVAL_MS",
                1500,
            )),
            max_refresh_failures: 5,
            relay_url: std::env::var("STREAM_RELAY_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

/// Which collaborator detection batches come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSourceKind {
    /// Device log endpoint, reached through the camera proxy
    Camera,
    /// REST backend log API
    Backend,
}

/// Detection polling settings
#[derive(Debug, Clone)]
pub struct PollingSettings {
    pub enabled: bool,
    pub interval: Duration,
    /// Upper bound of one fetch; kept below `interval`
    pub fetch_timeout: Duration,
    pub source: DetectionSourceKind,
}

impl Default for PollingSettings {
    fn default() -> Self {
        let source = match env_or("DETECTION_SOURCE", "camera").to_lowercase().as_str() {
            "backend" => DetectionSourceKind::Backend,
            _ => DetectionSourceKind::Camera,
        };

        Self {
            enabled: env_parse("DETECTION_POLLING_ENABLED", true),
            interval: Duration::from_millis(env_parse("DETECTION_POLL_INTERVAL_MS", 4000).max(100)),
            fetch_timeout: Duration::from_millis(env_parse("DETECTION_FETCH_TIMEOUT_MS", 3000)),
            source,
        }
    }
}

/// Durable storage engine for cursors and pending queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    File(PathBuf),
    Sqlite(String),
}

impl StorageBackend {
    fn from_env() -> Self {
        let path = env_or("STORAGE_PATH", "/var/lib/gate_camserver/store");
        match env_or("STORAGE_BACKEND", "file").to_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            "sqlite" => {
                if path.starts_with("sqlite:") {
                    StorageBackend::Sqlite(path)
                } else {
                    StorageBackend::Sqlite(format!("sqlite://{}", path))
                }
            }
            _ => StorageBackend::File(PathBuf::from(path)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Gate/camera configuration file (JSON)
    pub gates_file: PathBuf,
    /// REST backend base URL
    pub backend_api_url: String,
    pub proxy: ProxyConfig,
    pub stream: StreamSettings,
    pub polling: PollingSettings,
    pub storage: StorageBackend,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8080),
            gates_file: PathBuf::from(env_or("GATES_FILE", "/etc/gate_camserver/gates.json")),
            backend_api_url: env_or("BACKEND_API_URL", "http://127.0.0.1:8000/api/toll-v1")
                .trim_end_matches('/')
                .to_string(),
            proxy: ProxyConfig::default(),
            stream: StreamSettings::default(),
            polling: PollingSettings::default(),
            storage: StorageBackend::from_env(),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Gate/camera configuration (read-only)
    pub gates: Arc<GateRegistry>,
    /// CameraProxy (allowlisted camera gateway)
    pub proxy: Arc<CameraProxy>,
    /// StreamSessionController (protocol fallback per surface)
    pub streams: Arc<StreamSessionController>,
    /// DetectionPollingEngine (per-gate cursor + pending queue)
    pub detections: Arc<DetectionPollingEngine>,
    /// PassageClient (backend collaborator)
    pub passages: Arc<PassageClient>,
    /// RealtimeHub (WebSocket)
    pub realtime: Arc<RealtimeHub>,
    /// Process start, for health uptime
    pub started_at: Instant,
}
