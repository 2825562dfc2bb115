//! Pending queue entry types

use crate::detection_source::DetectionRecord;
use crate::gate_registry::{Direction, GateConfig, GateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator workflow state of a queued detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    #[default]
    Pending,
    /// Submission to the backend in progress
    Processing,
}

/// A detection accepted by the dedup engine, awaiting operator resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDetection {
    pub detection: DetectionRecord,
    pub gate_id: GateId,
    /// Best effort: the detection's own direction, else the gate's
    pub direction: Option<Direction>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub status: PendingStatus,
    /// When the current submission started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_since: Option<DateTime<Utc>>,
    /// Operator-assigned vehicle type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_type_id: Option<i64>,
}

impl PendingDetection {
    /// Attach the owning gate and a best-effort direction
    pub fn new(mut detection: DetectionRecord, gate: &GateConfig) -> Self {
        detection.gate_id = Some(gate.gate_id);
        Self {
            direction: detection.direction.or(gate.direction),
            detection,
            gate_id: gate.gate_id,
            received_at: Utc::now(),
            status: PendingStatus::Pending,
            processing_since: None,
            vehicle_type_id: None,
        }
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = PendingStatus::Processing;
        self.processing_since = Some(now);
    }

    pub fn mark_pending(&mut self) {
        self.status = PendingStatus::Pending;
        self.processing_since = None;
    }

    /// A submission that started before `cutoff` (or at an unknown time)
    /// is no longer in flight
    pub fn is_stale_processing(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == PendingStatus::Processing
            && self.processing_since.map_or(true, |since| since < cutoff)
    }

    pub fn id(&self) -> u64 {
        self.detection.id
    }
}
