//! StreamSession data types

use crate::camera_proxy::ProxyError;
use crate::gate_registry::GateId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Streaming protocols, in fallback preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    /// Optimized relay served by the backend
    Relay,
    /// Camera-native continuous frames
    Mjpeg,
    /// Periodic full-frame polling
    Snapshot,
    /// Segmented playback, last resort
    Hls,
}

impl StreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::Relay => "relay",
            StreamProtocol::Mjpeg => "mjpeg",
            StreamProtocol::Snapshot => "snapshot",
            StreamProtocol::Hls => "hls",
        }
    }

    /// Nominal rate; true frame counting is not available for every protocol
    pub fn nominal_fps(&self, device_frame_rate: f32) -> f32 {
        match self {
            StreamProtocol::Relay | StreamProtocol::Mjpeg => 1.0,
            StreamProtocol::Snapshot => 0.5,
            StreamProtocol::Hls => device_frame_rate,
        }
    }
}

/// Session lifecycle. `Error` and `Stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Ready,
    Starting,
    Live,
    Error,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Ready => "ready",
            SessionState::Starting => "starting",
            SessionState::Live => "live",
            SessionState::Error => "error",
            SessionState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error | SessionState::Stopped)
    }
}

/// What a transport hands the render target
#[derive(Debug, Clone)]
pub struct MediaSource {
    pub protocol: StreamProtocol,
    /// URL the browser loads for this media
    pub url: String,
    pub content_type: String,
    /// First (or latest) frame, when the transport decodes one
    pub frame: Option<Bytes>,
    pub captured_at: DateTime<Utc>,
}

impl MediaSource {
    pub fn new(protocol: StreamProtocol, url: String, content_type: impl Into<String>) -> Self {
        Self {
            protocol,
            url,
            content_type: content_type.into(),
            frame: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_frame(mut self, frame: Bytes) -> Self {
        self.frame = Some(frame);
        self
    }
}

/// Single transport attempt failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Transport(String),

    #[error("attempt cancelled")]
    Cancelled,
}

impl From<ProxyError> for StreamError {
    fn from(e: ProxyError) -> Self {
        StreamError::Transport(e.to_string())
    }
}

/// Observable session state
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub surface_id: String,
    pub gate_id: Option<GateId>,
    pub state: SessionState,
    /// Protocol being attempted, or the live one
    pub protocol: Option<StreamProtocol>,
    pub started_at: DateTime<Utc>,
    pub live_since: Option<DateTime<Utc>>,
    /// Failed attempts so far
    pub failures: u32,
    /// Current pass over the fallback chain (1-based)
    pub pass: u32,
    /// Protocols attempted, in order
    pub attempted: Vec<StreamProtocol>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub device_frame_rate: f32,
}

impl SessionSnapshot {
    pub fn new(surface_id: String, gate_id: Option<GateId>, device_frame_rate: f32) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            surface_id,
            gate_id,
            state: SessionState::Ready,
            protocol: None,
            started_at: Utc::now(),
            live_since: None,
            failures: 0,
            pass: 0,
            attempted: Vec::new(),
            last_error: None,
            device_frame_rate,
        }
    }

    /// Derived statistics; zero unless live
    pub fn stats(&self, now: DateTime<Utc>) -> StreamStats {
        match (self.state, self.live_since, self.protocol) {
            (SessionState::Live, Some(since), Some(protocol)) => {
                let uptime_sec = (now - since).num_seconds().max(0) as u64;
                StreamStats {
                    fps: protocol.nominal_fps(self.device_frame_rate),
                    uptime_sec,
                    uptime: format_uptime(uptime_sec),
                }
            }
            _ => StreamStats::default(),
        }
    }
}

/// Derived rate/uptime statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub fps: f32,
    pub uptime_sec: u64,
    /// `mm:ss`
    pub uptime: String,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self {
            fps: 0.0,
            uptime_sec: 0,
            uptime: format_uptime(0),
        }
    }
}

/// Snapshot plus stats, as served to the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub stats: StreamStats,
}

/// `mm:ss`; minutes keep counting past 59
pub fn format_uptime(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
