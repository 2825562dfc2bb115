//! RealtimeHub - WebSocket Distribution
//!
//! ## Responsibilities
//!
//! - WebSocket connection management
//! - Newly queued detections (operator confirmation prompt)
//! - Transient poll errors and camera reachability transitions
//! - Stream session state changes
//!
//! Notifications only: nothing sent here commits anything to the backend.

use crate::gate_registry::GateId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hub message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    /// New entries were durably queued for a gate
    DetectionsQueued(DetectionsQueuedMessage),
    /// A poll failed; the timer keeps running
    PollError(PollErrorMessage),
    CameraStatus(CameraStatusMessage),
    StreamStatus(StreamStatusMessage),
}

/// Detections queued message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionsQueuedMessage {
    pub gate_id: GateId,
    pub detection_ids: Vec<u64>,
    pub plates: Vec<String>,
    /// Cursor after this poll
    pub cursor: u64,
    pub timestamp: String,
}

/// Poll error message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollErrorMessage {
    pub gate_id: GateId,
    pub message: String,
    pub timestamp: String,
}

/// Camera status message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatusMessage {
    pub gate_id: GateId,
    pub online: bool,
    pub timestamp: String,
}

/// Stream session state message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatusMessage {
    pub surface_id: String,
    pub gate_id: Option<GateId>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(id, ClientConnection { id, tx });
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, "Client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Client disconnected");
        }
    }

    /// Broadcast message to all clients
    pub async fn broadcast(&self, message: HubMessage) {
        let msg_type = match &message {
            HubMessage::DetectionsQueued(_) => "detections_queued",
            HubMessage::PollError(_) => "poll_error",
            HubMessage::CameraStatus(_) => "camera_status",
            HubMessage::StreamStatus(_) => "stream_status",
        };
        tracing::debug!(message_type = %msg_type, "Broadcasting message to clients");

        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        let connections = self.connections.read().await;
        for conn in connections.values() {
            if let Err(e) = conn.tx.send(json.clone()) {
                tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
            }
        }
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
