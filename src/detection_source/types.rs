//! Detection record types and raw payload normalization

use crate::gate_registry::{Direction, GateId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One plate-recognition event, normalized.
///
/// `id` is only monotonic within one camera/gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: u64,
    /// Plate text as reported
    pub plate_raw: String,
    /// Uppercase alphanumerics only
    pub plate_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Capture timestamp as reported by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<GateId>,
}

/// Uppercase, strip separators and whitespace
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_f32(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl DetectionRecord {
    /// Build from one raw device/backend entry. `None` without a numeric id.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let id = field(obj, &["id", "detection_id"]).and_then(value_u64)?;

        let plate_raw = field(obj, &["plate_number", "numberplate", "plate", "originalplate"])
            .and_then(value_string)
            .unwrap_or_default();

        Some(Self {
            id,
            plate_number: normalize_plate(&plate_raw),
            plate_raw,
            confidence: field(obj, &["confidence", "globalconfidence"]).and_then(value_f32),
            lane: field(obj, &["lane", "laneid", "lane_id"]).and_then(value_string),
            direction: field(obj, &["direction"]).and_then(Direction::from_device),
            captured_at: field(
                obj,
                &["timestamp", "utctime", "detection_timestamp", "captured_at"],
            )
            .and_then(value_string),
            gate_id: field(obj, &["gate_id"])
                .and_then(value_u64)
                .and_then(|g| GateId::try_from(g).ok()),
        })
    }
}
