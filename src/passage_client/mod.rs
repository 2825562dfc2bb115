//! PassageClient - Backend Passage Submission
//!
//! ## Responsibilities
//!
//! - Turn an operator-confirmed pending detection into a vehicle
//!   entry/exit submission
//! - POST it to the REST backend collaborator
//!
//! Called only from the explicit operator confirm action, never by polling.

use crate::detection_store::PendingDetection;
use crate::error::{Error, Result};
use crate::gate_registry::{Direction, GateId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operator inputs accompanying a confirm
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub body_type_id: Option<i64>,
    /// Operator-corrected plate text
    #[serde(default)]
    pub plate_number: Option<String>,
    /// Overrides the queued direction
    #[serde(default)]
    pub direction: Option<Direction>,
}

/// Entry/exit submission body
#[derive(Debug, Clone, Serialize)]
pub struct PassageSubmission {
    pub plate_number: String,
    pub gate_id: GateId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_type_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub detection_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<String>,
    #[serde(skip)]
    pub direction: Direction,
}

impl PassageSubmission {
    /// Merge the queued detection with operator inputs (operator wins)
    pub fn from_pending(entry: &PendingDetection, request: &ConfirmRequest) -> Result<Self> {
        let direction = request.direction.or(entry.direction).ok_or_else(|| {
            Error::Validation(format!(
                "direction unknown for detection {}; specify entry or exit",
                entry.id()
            ))
        })?;

        let plate_number = request
            .plate_number
            .as_deref()
            .map(crate::detection_source::normalize_plate)
            .unwrap_or_else(|| entry.detection.plate_number.clone());
        if plate_number.is_empty() {
            return Err(Error::Validation(format!(
                "detection {} has no plate number",
                entry.id()
            )));
        }

        Ok(Self {
            plate_number,
            gate_id: entry.gate_id,
            body_type_id: request.body_type_id.or(entry.vehicle_type_id),
            operator: request.operator.clone(),
            detection_id: entry.id(),
            confidence: entry.detection.confidence,
            captured_at: entry.detection.captured_at.clone(),
            direction,
        })
    }
}

/// PassageClient instance
pub struct PassageClient {
    client: reqwest::Client,
    base_url: String,
}

impl PassageClient {
    /// Create new PassageClient
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Submit; any non-2xx is a failure
    pub async fn submit(&self, submission: &PassageSubmission) -> Result<serde_json::Value> {
        let url = format!(
            "{}/vehicle-passages/{}",
            self.base_url,
            submission.direction.as_str()
        );

        let resp = self.client.post(&url).json(submission).send().await?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            tracing::warn!(
                gate_id = submission.gate_id,
                detection_id = submission.detection_id,
                status = %status,
                "Backend rejected passage"
            );
            return Err(Error::Upstream(format!(
                "backend rejected passage ({}): {}",
                status, body
            )));
        }

        tracing::info!(
            gate_id = submission.gate_id,
            detection_id = submission.detection_id,
            direction = submission.direction.as_str(),
            "Passage submitted"
        );

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}
