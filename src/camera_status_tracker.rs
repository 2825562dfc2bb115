//! Camera Status Tracker
//!
//! Tracks per-gate camera reachability as seen by the detection poller.
//! Only transitions are logged and broadcast, so a camera that stays
//! offline does not spam the operator every poll.

use crate::gate_registry::GateId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Camera connection status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraConnectionStatus {
    /// Initial state (never polled)
    #[default]
    Unknown,
    /// Last poll reached the camera
    Online,
    /// Last poll failed
    Offline,
}

/// Camera status transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatusEvent {
    /// Online (or never seen) -> Offline
    Lost,
    /// Offline -> Online
    Recovered,
}

/// Tracks camera connection status and detects transitions
pub struct CameraStatusTracker {
    statuses: RwLock<HashMap<GateId, CameraConnectionStatus>>,
}

impl CameraStatusTracker {
    /// Create new tracker
    pub fn new() -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Update status and return the transition event, if any
    ///
    /// The first observation being Offline counts as `Lost`; the first
    /// being Online produces nothing.
    pub async fn update_status(&self, gate_id: GateId, is_online: bool) -> Option<CameraStatusEvent> {
        let mut statuses = self.statuses.write().await;
        let prev = statuses
            .get(&gate_id)
            .copied()
            .unwrap_or(CameraConnectionStatus::Unknown);

        let new_status = if is_online {
            CameraConnectionStatus::Online
        } else {
            CameraConnectionStatus::Offline
        };
        statuses.insert(gate_id, new_status);

        match (prev, new_status) {
            (CameraConnectionStatus::Online, CameraConnectionStatus::Offline) => {
                tracing::warn!(gate_id = gate_id, "Camera connection lost");
                Some(CameraStatusEvent::Lost)
            }
            (CameraConnectionStatus::Offline, CameraConnectionStatus::Online) => {
                tracing::info!(gate_id = gate_id, "Camera connection recovered");
                Some(CameraStatusEvent::Recovered)
            }
            (CameraConnectionStatus::Unknown, CameraConnectionStatus::Offline) => {
                tracing::warn!(gate_id = gate_id, "Camera initial poll failed - marking as lost");
                Some(CameraStatusEvent::Lost)
            }
            _ => None,
        }
    }

    /// Get current status for a gate's camera
    pub async fn get_status(&self, gate_id: GateId) -> CameraConnectionStatus {
        self.statuses
            .read()
            .await
            .get(&gate_id)
            .copied()
            .unwrap_or(CameraConnectionStatus::Unknown)
    }

    /// Forget a gate (poller stopped)
    pub async fn remove(&self, gate_id: GateId) {
        self.statuses.write().await.remove(&gate_id);
    }
}

impl Default for CameraStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
