//! Stream transports: one per protocol in the fallback chain
//!
//! A transport's `open` resolves once the first renderable frame (or a
//! valid playlist) has arrived. The controller bounds it with the
//! first-frame timeout and cancels it on teardown; transports never
//! touch a render target themselves.

use super::{MediaSource, StreamError, StreamProtocol};
use crate::camera_proxy::CameraProxy;
use crate::gate_registry::CameraDevice;
use crate::state::StreamSettings;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Method, Url};
use std::sync::Arc;
use std::time::Duration;

/// Frames larger than this are treated as a broken stream
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

#[async_trait]
pub trait StreamTransport: Send + Sync {
    fn protocol(&self) -> StreamProtocol;

    /// Capability check; unsupported transports are skipped, not failed
    fn supports(&self, _camera: &CameraDevice) -> bool {
        true
    }

    /// Connect and wait for the first frame
    async fn open(&self, camera: &CameraDevice) -> Result<MediaSource, StreamError>;

    /// Refresh period while live, for transports that poll
    fn refresh_interval(&self) -> Option<Duration> {
        None
    }

    async fn refresh(&self, camera: &CameraDevice) -> Result<MediaSource, StreamError> {
        self.open(camera).await
    }
}

/// Default HTTP fallback chain: relay (when configured), MJPEG, snapshot, HLS
pub fn http_transports(
    proxy: Arc<CameraProxy>,
    settings: &StreamSettings,
) -> Vec<Arc<dyn StreamTransport>> {
    let mut chain: Vec<Arc<dyn StreamTransport>> = Vec::new();
    if let Some(relay_url) = &settings.relay_url {
        chain.push(Arc::new(RelayTransport::new(relay_url)));
    }
    chain.push(Arc::new(MjpegTransport::new(proxy.clone())));
    chain.push(Arc::new(SnapshotTransport::new(
        proxy.clone(),
        settings.snapshot_interval,
    )));
    chain.push(Arc::new(HlsTransport::new(proxy)));
    chain
}

/// Browser-loadable URL for a camera resource behind the proxy
fn proxied_url(proxy: &CameraProxy, target: &str, category: &str) -> String {
    format!(
        "{}?url={}&type={}",
        proxy.config().public_path,
        urlencoding::encode(target),
        category
    )
}

fn parse_url(raw: &str) -> Result<Url, StreamError> {
    Url::parse(raw).map_err(|e| StreamError::Transport(format!("invalid stream URL: {}", e)))
}

/// Byte range of the first complete JPEG frame in `buf`
fn find_jpeg_frame(buf: &[u8]) -> Option<(usize, usize)> {
    let start = buf.windows(2).position(|w| w == JPEG_SOI)?;
    let end = buf[start + 2..]
        .windows(2)
        .position(|w| w == JPEG_EOI)?;
    Some((start, start + 2 + end + 2))
}

/// Read a multipart/JPEG body until one whole frame is buffered
async fn read_first_frame(mut response: reqwest::Response) -> Result<Bytes, StreamError> {
    let mut buf = BytesMut::new();
    loop {
        let chunk = response
            .chunk()
            .await
            .map_err(|e| StreamError::Transport(e.without_url().to_string()))?;

        let Some(chunk) = chunk else {
            return Err(StreamError::Transport(
                "stream ended before the first frame".to_string(),
            ));
        };
        buf.extend_from_slice(&chunk);

        if let Some((start, end)) = find_jpeg_frame(&buf) {
            return Ok(buf.freeze().slice(start..end));
        }
        if buf.len() > MAX_FRAME_BYTES {
            return Err(StreamError::Transport(
                "no frame boundary within size limit".to_string(),
            ));
        }
    }
}

fn looks_like_image(content_type: Option<&str>, body: &[u8]) -> bool {
    if body.starts_with(&JPEG_SOI) {
        return true;
    }
    content_type
        .map(|ct| ct.to_ascii_lowercase().starts_with("image/"))
        .unwrap_or(false)
        && !body.is_empty()
}

// ========================================
// Relay
// ========================================

/// Backend relay: `{relay_url}/{relay_name}` serving multipart JPEG
pub struct RelayTransport {
    client: reqwest::Client,
    base_url: String,
}

impl RelayTransport {
    /// Create new RelayTransport
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn stream_url(&self, camera: &CameraDevice) -> String {
        format!(
            "{}/{}",
            self.base_url,
            urlencoding::encode(camera.relay_name())
        )
    }
}

#[async_trait]
impl StreamTransport for RelayTransport {
    fn protocol(&self) -> StreamProtocol {
        StreamProtocol::Relay
    }

    async fn open(&self, camera: &CameraDevice) -> Result<MediaSource, StreamError> {
        let url = self.stream_url(camera);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StreamError::Transport(e.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(StreamError::Transport(format!(
                "relay returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let frame = read_first_frame(response).await?;
        Ok(MediaSource::new(StreamProtocol::Relay, url, "multipart/x-mixed-replace").with_frame(frame))
    }
}

// ========================================
// MJPEG
// ========================================

/// Camera-native MJPEG through the proxy
pub struct MjpegTransport {
    proxy: Arc<CameraProxy>,
}

impl MjpegTransport {
    /// Create new MjpegTransport
    pub fn new(proxy: Arc<CameraProxy>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl StreamTransport for MjpegTransport {
    fn protocol(&self) -> StreamProtocol {
        StreamProtocol::Mjpeg
    }

    fn supports(&self, camera: &CameraDevice) -> bool {
        camera.supports_mjpeg
    }

    async fn open(&self, camera: &CameraDevice) -> Result<MediaSource, StreamError> {
        let target = camera.mjpeg_url();
        let url = parse_url(&target)?;
        let credentials = camera.credentials(self.proxy.default_credentials());

        let response = self.proxy.send(Method::GET, &url, &credentials).await?;
        let frame = read_first_frame(response).await?;

        Ok(MediaSource::new(
            StreamProtocol::Mjpeg,
            proxied_url(&self.proxy, &target, "stream"),
            "multipart/x-mixed-replace",
        )
        .with_frame(frame))
    }
}

// ========================================
// Snapshot
// ========================================

/// Still image polling through the proxy
pub struct SnapshotTransport {
    proxy: Arc<CameraProxy>,
    interval: Duration,
}

impl SnapshotTransport {
    /// Create new SnapshotTransport
    pub fn new(proxy: Arc<CameraProxy>, interval: Duration) -> Self {
        Self { proxy, interval }
    }
}

#[async_trait]
impl StreamTransport for SnapshotTransport {
    fn protocol(&self) -> StreamProtocol {
        StreamProtocol::Snapshot
    }

    fn supports(&self, camera: &CameraDevice) -> bool {
        camera.supports_snapshot
    }

    async fn open(&self, camera: &CameraDevice) -> Result<MediaSource, StreamError> {
        let target = camera.snapshot_url();
        let url = parse_url(&target)?;
        let credentials = camera.credentials(self.proxy.default_credentials());

        let (content_type, body) = self.proxy.get_bytes(&url, &credentials).await?;
        if !looks_like_image(content_type.as_deref(), &body) {
            return Err(StreamError::Transport(
                "snapshot response is not an image".to_string(),
            ));
        }

        Ok(MediaSource::new(
            StreamProtocol::Snapshot,
            proxied_url(&self.proxy, &target, "snapshot"),
            content_type.unwrap_or_else(|| "image/jpeg".to_string()),
        )
        .with_frame(body))
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

// ========================================
// HLS
// ========================================

/// Segmented playback; success means a valid playlist came back
pub struct HlsTransport {
    proxy: Arc<CameraProxy>,
}

impl HlsTransport {
    /// Create new HlsTransport
    pub fn new(proxy: Arc<CameraProxy>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl StreamTransport for HlsTransport {
    fn protocol(&self) -> StreamProtocol {
        StreamProtocol::Hls
    }

    async fn open(&self, camera: &CameraDevice) -> Result<MediaSource, StreamError> {
        let target = camera.hls_url();
        let url = parse_url(&target)?;
        let credentials = camera.credentials(self.proxy.default_credentials());

        let (_, body) = self.proxy.get_bytes(&url, &credentials).await?;
        let text = String::from_utf8_lossy(&body);
        if !text.trim_start_matches('\u{feff}').trim_start().starts_with("#EXTM3U") {
            return Err(StreamError::Transport("not an HLS playlist".to_string()));
        }

        Ok(MediaSource::new(
            StreamProtocol::Hls,
            proxied_url(&self.proxy, &target, "stream"),
            "application/vnd.apple.mpegurl",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProxyConfig;

    #[test]
    fn test_find_jpeg_frame() {
        let mut buf = b"--boundary\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let header_len = buf.len();
        buf.extend_from_slice(&[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        buf.extend_from_slice(b"\r\n--boundary");

        let (start, end) = find_jpeg_frame(&buf).unwrap();
        assert_eq!(start, header_len);
        assert_eq!(&buf[start..end], &[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
    }

    #[test]
    fn test_partial_frame_not_found() {
        assert!(find_jpeg_frame(&[0xFF, 0xD8, 0x01, 0x02]).is_none());
        assert!(find_jpeg_frame(b"--boundary").is_none());
    }

    #[test]
    fn test_looks_like_image() {
        assert!(looks_like_image(None, &[0xFF, 0xD8, 0x00]));
        assert!(looks_like_image(Some("image/png"), b"\x89PNG"));
        assert!(!looks_like_image(Some("text/html"), b"<html>"));
        assert!(!looks_like_image(Some("image/jpeg"), b""));
    }

    #[test]
    fn test_chain_order_and_capabilities() {
        let proxy = Arc::new(CameraProxy::new(ProxyConfig {
            allowlist: Default::default(),
            timeout: Duration::from_secs(5),
            default_credentials: Default::default(),
            public_path: "/camera-proxy".to_string(),
        }));
        let mut settings = StreamSettings::default();
        settings.relay_url = None;

        let chain = http_transports(proxy.clone(), &settings);
        let order: Vec<_> = chain.iter().map(|t| t.protocol()).collect();
        assert_eq!(
            order,
            vec![
                StreamProtocol::Mjpeg,
                StreamProtocol::Snapshot,
                StreamProtocol::Hls
            ]
        );

        settings.relay_url = Some("http://127.0.0.1:9000/stream".to_string());
        let chain = http_transports(proxy, &settings);
        assert_eq!(chain[0].protocol(), StreamProtocol::Relay);

        let mut camera = CameraDevice::new("192.168.1.50");
        camera.supports_mjpeg = false;
        let supported: Vec<_> = chain
            .iter()
            .filter(|t| t.supports(&camera))
            .map(|t| t.protocol())
            .collect();
        assert!(!supported.contains(&StreamProtocol::Mjpeg));
    }
}
