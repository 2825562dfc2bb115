//! Shared integration test harness
#![allow(dead_code)]

use async_trait::async_trait;
use gate_camserver::camera_proxy::CameraProxy;
use gate_camserver::camera_status_tracker::CameraStatusTracker;
use gate_camserver::detection_poller::DetectionPollingEngine;
use gate_camserver::detection_source::{normalize_plate, DetectionRecord, DetectionSource};
use gate_camserver::detection_store::{GateStore, KvStore, MemoryStore};
use gate_camserver::gate_registry::{GateConfig, GateRegistry};
use gate_camserver::models::Credentials;
use gate_camserver::passage_client::PassageClient;
use gate_camserver::realtime_hub::RealtimeHub;
use gate_camserver::state::{
    AppConfig, AppState, DetectionSourceKind, PollingSettings, ProxyConfig, StreamSettings,
};
use gate_camserver::stream_session::{http_transports, StreamSessionController};
use gate_camserver::{Error, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Serve `router` on an ephemeral local port
pub async fn spawn_server(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub fn proxy_config(hosts: &[&str]) -> ProxyConfig {
    ProxyConfig {
        allowlist: hosts.iter().map(|h| h.to_string()).collect(),
        timeout: Duration::from_secs(5),
        default_credentials: Credentials::new("admin", "secret"),
        public_path: "/camera-proxy".to_string(),
    }
}

pub fn polling_settings(interval: Duration) -> PollingSettings {
    PollingSettings {
        enabled: true,
        interval,
        fetch_timeout: interval,
        source: DetectionSourceKind::Camera,
    }
}

pub fn stream_settings() -> StreamSettings {
    StreamSettings {
        first_frame_timeout: Duration::from_secs(2),
        backoff: Duration::from_millis(50),
        max_passes: 1,
        snapshot_interval: Duration::from_millis(500),
        max_refresh_failures: 5,
        relay_url: None,
    }
}

pub fn record(id: u64, plate: &str) -> DetectionRecord {
    DetectionRecord {
        id,
        plate_raw: plate.to_string(),
        plate_number: normalize_plate(plate),
        confidence: Some(0.9),
        lane: None,
        direction: None,
        captured_at: None,
        gate_id: None,
    }
}

/// Detection source returning whatever batch the test set last.
///
/// Responses queued with `enqueue` are served first, one per fetch.
#[derive(Default)]
pub struct ScriptedSource {
    scripted: Mutex<VecDeque<(Duration, Vec<DetectionRecord>)>>,
    batch: Mutex<Vec<DetectionRecord>>,
    failing: Mutex<bool>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_batch(&self, batch: Vec<DetectionRecord>) {
        *self.batch.lock().unwrap() = batch;
    }

    pub fn enqueue(&self, delay: Duration, batch: Vec<DetectionRecord>) {
        self.scripted.lock().unwrap().push_back((delay, batch));
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionSource for ScriptedSource {
    async fn fetch(&self, _gate: &GateConfig) -> Result<Vec<DetectionRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.scripted.lock().unwrap().pop_front();
        if let Some((delay, batch)) = next {
            tokio::time::sleep(delay).await;
            return Ok(batch);
        }

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.failing.lock().unwrap() {
            return Err(Error::Upstream("camera offline".to_string()));
        }
        Ok(self.batch.lock().unwrap().clone())
    }
}

/// In-memory store whose queue appends can be made to fail once
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    /// Successful appends left before the next one fails
    appends_before_failure: Mutex<Option<usize>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_after_appends(&self, successful: usize) {
        *self.appends_before_failure.lock().unwrap() = Some(successful);
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        self.inner.get(scope, key).await
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<()> {
        self.inner.set(scope, key, value).await
    }

    async fn append(&self, scope: &str, key: &str, item: Value) -> Result<()> {
        let fail = {
            let mut remaining = self.appends_before_failure.lock().unwrap();
            match *remaining {
                Some(0) => {
                    *remaining = None;
                    true
                }
                Some(n) => {
                    *remaining = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if fail {
            return Err(Error::Storage("disk full".to_string()));
        }
        self.inner.append(scope, key, item).await
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<()> {
        self.inner.remove(scope, key).await
    }
}

pub fn engine(
    source: Arc<dyn DetectionSource>,
    kv: Arc<dyn KvStore>,
    interval: Duration,
) -> DetectionPollingEngine {
    DetectionPollingEngine::new(
        source,
        Arc::new(GateStore::new(kv)),
        Arc::new(RealtimeHub::new()),
        Arc::new(CameraStatusTracker::new()),
        &polling_settings(interval),
    )
}

/// Full application state around the given gates and collaborators
pub fn app_state(
    proxy: ProxyConfig,
    gates: Vec<GateConfig>,
    source: Arc<dyn DetectionSource>,
    backend_api_url: &str,
) -> AppState {
    let mut config = AppConfig::default();
    config.proxy = proxy.clone();
    config.stream = stream_settings();
    config.backend_api_url = backend_api_url.to_string();

    let proxy = Arc::new(CameraProxy::new(proxy));
    let realtime = Arc::new(RealtimeHub::new());
    let detections = Arc::new(DetectionPollingEngine::new(
        source,
        Arc::new(GateStore::new(Arc::new(MemoryStore::new()))),
        realtime.clone(),
        Arc::new(CameraStatusTracker::new()),
        &polling_settings(Duration::from_secs(4)),
    ));
    let streams = Arc::new(
        StreamSessionController::new(
            http_transports(proxy.clone(), &config.stream),
            config.stream.clone(),
        )
        .with_hub(realtime.clone()),
    );

    AppState {
        gates: Arc::new(GateRegistry::from_gates(gates).unwrap()),
        proxy,
        streams,
        detections,
        passages: Arc::new(PassageClient::new(backend_api_url.to_string())),
        realtime,
        started_at: Instant::now(),
        config,
    }
}
