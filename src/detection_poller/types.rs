//! DetectionPoller types

use crate::camera_status_tracker::CameraConnectionStatus;
use crate::detection_source::DetectionRecord;
use crate::detection_store::PendingDetection;
use crate::gate_registry::GateId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of one completed poll
#[derive(Debug, Clone, Serialize)]
pub struct PollOutcome {
    pub gate_id: GateId,
    /// Entries returned by the source
    pub fetched: usize,
    /// Ids newly inserted into the pending queue
    pub queued: Vec<u64>,
    /// Cursor after the poll
    pub cursor: u64,
    /// The latest-id probe showed nothing new; no full fetch
    pub unchanged: bool,
}

/// Listener notification for newly queued entries
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub gate_id: GateId,
    pub entries: Vec<PendingDetection>,
    pub cursor: u64,
}

/// Per-gate polling status, user-visible
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStatus {
    pub gate_id: GateId,
    pub running: bool,
    pub cursor: u64,
    pub polls: u64,
    pub queued_total: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Transient, non-fatal; cleared by the next successful poll
    pub last_error: Option<String>,
    /// Camera reachability as of the last poll
    pub camera: CameraConnectionStatus,
}

/// What the fetch phase produced
pub(crate) enum Fetched {
    Unchanged { cursor: u64 },
    Batch { cursor: u64, records: Vec<DetectionRecord> },
}

/// Poll failure classes
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Source unreachable or returned garbage; camera marked offline
    #[error("Failed to fetch detections: {0}")]
    Fetch(crate::error::Error),

    /// Queue or cursor write failed; cursor not advanced
    #[error("Failed to persist detections: {0}")]
    Persist(crate::error::Error),
}
