//! REST backend log source

use super::{parse_batch, DetectionRecord, DetectionSource};
use crate::error::{Error, Result};
use crate::gate_registry::GateConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Reads detections the backend already collected per gate
pub struct BackendDetectionSource {
    client: reqwest::Client,
    base_url: String,
}

impl BackendDetectionSource {
    /// Create new BackendDetectionSource
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json(&self, path: &str, gate: &GateConfig) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(&[("gate_id", gate.gate_id)])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "detection backend returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl DetectionSource for BackendDetectionSource {
    async fn fetch(&self, gate: &GateConfig) -> Result<Vec<DetectionRecord>> {
        let payload = self.get_json("/camera-detection/logs", gate).await?;
        parse_batch(&payload)
    }

    async fn latest_id(&self, gate: &GateConfig) -> Result<Option<u64>> {
        let payload = self.get_json("/camera-detection/logs/latest", gate).await?;
        let body = payload.get("data").unwrap_or(&payload);
        Ok(body.get("latest_id").and_then(Value::as_u64))
    }
}
