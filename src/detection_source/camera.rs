//! Device log source (ZKTeco `vparcgi.cgi`), reached through the camera proxy

use super::{parse_batch, DetectionRecord, DetectionSource};
use crate::camera_proxy::CameraProxy;
use crate::error::{Error, Result};
use crate::gate_registry::{CameraDevice, GateConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::sync::Arc;

const DEFAULT_SINCE: &str = "2000-01-01T00:00:00.000";

/// Device detection-log URL. `now_ms` is a cache buster.
pub fn detection_log_url(
    camera: &CameraDevice,
    since: Option<DateTime<Utc>>,
    now_ms: i64,
) -> String {
    let since = since
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| DEFAULT_SINCE.to_string());

    format!(
        "{}?computerid={}&oper=jsonlastresults&dd={}&_={}",
        camera.endpoint_url("/edge/cgi-bin/vparcgi.cgi"),
        camera.computer_id,
        urlencoding::encode(&since),
        now_ms
    )
}

/// Reads the camera's own recent-results log
pub struct CameraDetectionSource {
    proxy: Arc<CameraProxy>,
}

impl CameraDetectionSource {
    /// Create new CameraDetectionSource
    pub fn new(proxy: Arc<CameraProxy>) -> Self {
        Self { proxy }
    }

    /// Raw device payload, for the dashboard relay
    pub async fn fetch_raw(&self, camera: &CameraDevice) -> Result<serde_json::Value> {
        let url = detection_log_url(camera, None, Utc::now().timestamp_millis());
        let url = Url::parse(&url).map_err(|e| Error::Config(format!("camera address: {}", e)))?;
        let credentials = camera.credentials(self.proxy.default_credentials());

        let (_, body) = self.proxy.get_bytes(&url, &credentials).await?;
        let payload: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| Error::Upstream(format!("camera returned invalid payload: {}", e)))?;
        if !payload.is_array() {
            return Err(Error::Upstream("camera returned invalid payload".to_string()));
        }
        Ok(payload)
    }
}

#[async_trait]
impl DetectionSource for CameraDetectionSource {
    async fn fetch(&self, gate: &GateConfig) -> Result<Vec<DetectionRecord>> {
        let camera = gate.camera.as_ref().ok_or_else(|| {
            Error::Validation(format!("gate {} has no camera configured", gate.gate_id))
        })?;
        let payload = self.fetch_raw(camera).await?;
        parse_batch(&payload)
    }
}
