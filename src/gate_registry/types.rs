//! GateRegistry data types
//!
//! Gate and camera device configuration, loaded once and never mutated.

use crate::models::Credentials;
use serde::{Deserialize, Serialize};

/// Gate identifier
pub type GateId = u32;

/// Gate travel direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Entry,
    Exit,
}

impl Direction {
    /// Parse device-reported direction (`0`/`1`, or words)
    pub fn from_device(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => match n.as_i64()? {
                0 => Some(Direction::Entry),
                1 => Some(Direction::Exit),
                _ => None,
            },
            serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
                "0" | "entry" | "in" | "enter" => Some(Direction::Entry),
                "1" | "exit" | "out" => Some(Direction::Exit),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Entry => "entry",
            Direction::Exit => "exit",
        }
    }
}

/// RTSP stream selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspStream {
    Main,
    Sub,
}

/// One physical camera
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraDevice {
    pub ip_address: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_rtsp_port")]
    pub rtsp_port: u16,
    #[serde(default)]
    pub use_https: bool,
    /// Falls back to the configured default when absent
    #[serde(default, skip_serializing)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub supports_snapshot: bool,
    #[serde(default = "default_true")]
    pub supports_mjpeg: bool,
    /// Device-side log partition (ZKTeco `computerid`)
    #[serde(default = "default_computer_id")]
    pub computer_id: u32,
    /// Native frame rate, used as the nominal HLS rate
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f32,
    /// Stream name on the optimized relay; defaults to the address
    #[serde(default)]
    pub relay_name: Option<String>,
    #[serde(default = "default_mjpeg_path")]
    pub mjpeg_path: String,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_hls_path")]
    pub hls_path: String,
    #[serde(default = "default_rtsp_main_path")]
    pub rtsp_main_path: String,
    #[serde(default = "default_rtsp_sub_path")]
    pub rtsp_sub_path: String,
}

fn default_http_port() -> u16 {
    80
}
fn default_rtsp_port() -> u16 {
    554
}
fn default_true() -> bool {
    true
}
fn default_computer_id() -> u32 {
    1
}
fn default_frame_rate() -> f32 {
    25.0
}
fn default_mjpeg_path() -> String {
    "/cgi-bin/mjpeg".to_string()
}
fn default_snapshot_path() -> String {
    "/cgi-bin/snapshot.cgi".to_string()
}
fn default_hls_path() -> String {
    "/stream.m3u8".to_string()
}
fn default_rtsp_main_path() -> String {
    "/ch01".to_string()
}
fn default_rtsp_sub_path() -> String {
    "/ch01_sub".to_string()
}

impl CameraDevice {
    /// Create a device with default ports, paths and capabilities
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            http_port: default_http_port(),
            rtsp_port: default_rtsp_port(),
            use_https: false,
            username: None,
            password: None,
            supports_snapshot: true,
            supports_mjpeg: true,
            computer_id: default_computer_id(),
            frame_rate: default_frame_rate(),
            relay_name: None,
            mjpeg_path: default_mjpeg_path(),
            snapshot_path: default_snapshot_path(),
            hls_path: default_hls_path(),
            rtsp_main_path: default_rtsp_main_path(),
            rtsp_sub_path: default_rtsp_sub_path(),
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_https {
            "https"
        } else {
            "http"
        }
    }

    /// `scheme://host[:port]`, port omitted when it is the scheme default
    pub fn base_url(&self) -> String {
        let default_port = if self.use_https { 443 } else { 80 };
        if self.http_port == default_port {
            format!("{}://{}", self.scheme(), self.ip_address)
        } else {
            format!("{}://{}:{}", self.scheme(), self.ip_address, self.http_port)
        }
    }

    /// Absolute URL for a device path (leading slash optional)
    pub fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }

    pub fn mjpeg_url(&self) -> String {
        self.endpoint_url(&self.mjpeg_path)
    }

    pub fn snapshot_url(&self) -> String {
        self.endpoint_url(&self.snapshot_path)
    }

    pub fn hls_url(&self) -> String {
        self.endpoint_url(&self.hls_path)
    }

    /// Device credentials, falling back field by field to `defaults`
    pub fn credentials(&self, defaults: &Credentials) -> Credentials {
        defaults.overridden_by(self.username.as_deref(), self.password.as_deref())
    }

    /// RTSP URL for external players, credentials percent-encoded
    pub fn rtsp_url(&self, stream: RtspStream, defaults: &Credentials) -> String {
        let creds = self.credentials(defaults);
        let path = match stream {
            RtspStream::Main => &self.rtsp_main_path,
            RtspStream::Sub => &self.rtsp_sub_path,
        };
        let path = path.trim_start_matches('/');

        if creds.username.is_empty() {
            return format!("rtsp://{}:{}/{}", self.ip_address, self.rtsp_port, path);
        }

        format!(
            "rtsp://{}:{}@{}:{}/{}",
            urlencoding::encode(&creds.username),
            urlencoding::encode(&creds.password),
            self.ip_address,
            self.rtsp_port,
            path
        )
    }

    pub fn relay_name(&self) -> &str {
        self.relay_name.as_deref().unwrap_or(&self.ip_address)
    }
}

/// Gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub gate_id: GateId,
    #[serde(default)]
    pub name: String,
    /// Used when a detection carries no direction of its own
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub camera: Option<CameraDevice>,
}

impl GateConfig {
    pub fn new(gate_id: GateId, name: impl Into<String>) -> Self {
        Self {
            gate_id,
            name: name.into(),
            direction: None,
            camera: None,
        }
    }

    pub fn with_camera(mut self, camera: CameraDevice) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }
}
