//! DetectionSource - Plate Detection Feeds
//!
//! ## Responsibilities
//!
//! - Fetch the current detection batch for a gate
//! - Normalize raw device/backend payloads into `DetectionRecord`
//! - Optional lightweight "latest id" probe
//!
//! Sources make no ordering promise; callers compare ids only.

mod backend;
mod camera;
mod types;

pub use backend::BackendDetectionSource;
pub use camera::{detection_log_url, CameraDetectionSource};
pub use types::*;

use crate::error::{Error, Result};
use crate::gate_registry::GateConfig;
use async_trait::async_trait;
use serde_json::Value;

/// Detection feed abstraction
#[async_trait]
pub trait DetectionSource: Send + Sync {
    /// Full current batch for the gate's camera
    async fn fetch(&self, gate: &GateConfig) -> Result<Vec<DetectionRecord>>;

    /// Highest id the source currently knows, when cheaply available
    async fn latest_id(&self, _gate: &GateConfig) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Normalize a raw batch: a bare array or an envelope holding one
pub fn parse_batch(payload: &Value) -> Result<Vec<DetectionRecord>> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(obj) => ["data", "results", "detections", "logs"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array))
            .ok_or_else(|| Error::Parse("detection payload has no array".to_string()))?,
        _ => return Err(Error::Parse("detection payload is not an array".to_string())),
    };

    let records: Vec<DetectionRecord> = items.iter().filter_map(DetectionRecord::from_raw).collect();
    let dropped = items.len() - records.len();
    if dropped > 0 {
        tracing::debug!(dropped = dropped, "Dropped detections without a numeric id");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_array_keeps_source_order() {
        let batch = parse_batch(&json!([
            {"id": 5, "numberplate": "A1"},
            {"id": "n/a"},
            {"id": 7, "numberplate": "B2"},
            {"id": 6, "numberplate": "C3"}
        ]))
        .unwrap();
        let ids: Vec<u64> = batch.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![5, 7, 6]);
    }

    #[test]
    fn test_parse_envelope() {
        let batch = parse_batch(&json!({"data": [{"id": 1, "plate_number": "X"}]})).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(matches!(parse_batch(&json!({"error": "x"})), Err(Error::Parse(_))));
        assert!(matches!(parse_batch(&json!("nope")), Err(Error::Parse(_))));
    }
}
