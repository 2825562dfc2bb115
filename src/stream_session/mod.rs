//! StreamSessionController - Live View Protocol Fallback
//!
//! ## Responsibilities
//!
//! - One session per render surface; a new start tears the old one down first
//! - Ordered fallback over relay, MJPEG, snapshot and HLS
//! - Bounded first-frame wait per attempt, short backoff, fixed number of passes
//! - Snapshot refresh while live, giving up after repeated failures
//! - Derived uptime and nominal frame rate
//!
//! Only the session owning a surface's current generation may attach to or
//! release that surface.

mod render;
mod transport;
mod types;

pub use render::{FrameSlot, RenderTarget};
pub use transport::{
    http_transports, HlsTransport, MjpegTransport, RelayTransport, SnapshotTransport,
    StreamTransport,
};
pub use types::*;

use crate::gate_registry::{CameraDevice, GateId};
use crate::realtime_hub::{HubMessage, RealtimeHub, StreamStatusMessage};
use crate::state::StreamSettings;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Message recorded when a live snapshot session gives up
pub const REFRESH_EXHAUSTED: &str = "Too many consecutive snapshot failures";

// ========================================
// Surfaces
// ========================================

struct Surface {
    id: String,
    target: Arc<dyn RenderTarget>,
    /// Set when the surface is server-side and frames can be read back
    frames: Option<Arc<FrameSlot>>,
    /// Generation allowed to write into `target`
    owner: StdMutex<u64>,
    active: Mutex<Option<SessionHandle>>,
}

impl Surface {
    fn new(id: &str, target: Arc<dyn RenderTarget>, frames: Option<Arc<FrameSlot>>) -> Self {
        Self {
            id: id.to_string(),
            target,
            frames,
            owner: StdMutex::new(0),
            active: Mutex::new(None),
        }
    }

    fn owner(&self) -> MutexGuard<'_, u64> {
        self.owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move ownership to a fresh generation; older sessions lose write access
    fn claim(&self) -> u64 {
        let mut owner = self.owner();
        *owner += 1;
        *owner
    }

    fn attach(&self, generation: u64, source: MediaSource) -> bool {
        let owner = self.owner();
        if *owner != generation {
            return false;
        }
        self.target.attach(source);
        true
    }

    fn release(&self, generation: u64) {
        let owner = self.owner();
        if *owner == generation {
            self.target.release();
        }
    }
}

struct SessionHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Cancel and wait until the session task has released the surface
    async fn teardown(&mut self) -> SessionSnapshot {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Stream session task failed");
            }
        }
        let snapshot = self.state.borrow().clone();
        snapshot
    }
}

// ========================================
// Controller
// ========================================

/// StreamSessionController instance
pub struct StreamSessionController {
    transports: Vec<Arc<dyn StreamTransport>>,
    settings: StreamSettings,
    surfaces: RwLock<HashMap<String, Arc<Surface>>>,
    hub: Option<Arc<RealtimeHub>>,
}

impl StreamSessionController {
    /// Create new StreamSessionController. `transports` is the fallback order.
    pub fn new(transports: Vec<Arc<dyn StreamTransport>>, settings: StreamSettings) -> Self {
        Self {
            transports,
            settings,
            surfaces: RwLock::new(HashMap::new()),
            hub: None,
        }
    }

    /// Publish state changes to WebSocket clients
    pub fn with_hub(mut self, hub: Arc<RealtimeHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Fallback chain for one camera, unsupported protocols pruned
    pub fn chain_for(&self, camera: &CameraDevice) -> Vec<Arc<dyn StreamTransport>> {
        self.transports
            .iter()
            .filter(|t| t.supports(camera))
            .cloned()
            .collect()
    }

    /// Bind a surface to an external render target.
    ///
    /// Any session on a previous binding is stopped first.
    pub async fn register_surface(&self, surface_id: &str, target: Arc<dyn RenderTarget>) {
        let previous = {
            let mut surfaces = self.surfaces.write().await;
            surfaces.insert(
                surface_id.to_string(),
                Arc::new(Surface::new(surface_id, target, None)),
            )
        };

        if let Some(previous) = previous {
            if let Some(handle) = previous.active.lock().await.as_mut() {
                handle.teardown().await;
            }
            previous.claim();
        }
    }

    /// Surface by id; unknown ids get an in-memory frame slot
    async fn surface(&self, surface_id: &str) -> Arc<Surface> {
        if let Some(surface) = self.surfaces.read().await.get(surface_id) {
            return surface.clone();
        }

        let mut surfaces = self.surfaces.write().await;
        surfaces
            .entry(surface_id.to_string())
            .or_insert_with(|| {
                let slot = Arc::new(FrameSlot::new());
                Arc::new(Surface::new(surface_id, slot.clone(), Some(slot)))
            })
            .clone()
    }

    async fn existing(&self, surface_id: &str) -> Option<Arc<Surface>> {
        self.surfaces.read().await.get(surface_id).cloned()
    }

    /// Start a session on a surface.
    ///
    /// Returns once the previous session (if any) has fully released the
    /// surface and the new one is in `starting`.
    pub async fn start(
        &self,
        surface_id: &str,
        gate_id: Option<GateId>,
        camera: CameraDevice,
    ) -> SessionSnapshot {
        let surface = self.surface(surface_id).await;
        let mut active = surface.active.lock().await;

        if let Some(previous) = active.as_mut() {
            let ended = previous.teardown().await;
            tracing::info!(
                surface_id = %surface_id,
                session_id = %ended.session_id,
                "Replaced stream session"
            );
        }

        let generation = surface.claim();
        let mut snapshot =
            SessionSnapshot::new(surface_id.to_string(), gate_id, camera.frame_rate);
        snapshot.state = SessionState::Starting;

        let (tx, rx) = watch::channel(snapshot.clone());
        let token = CancellationToken::new();

        let session = SessionTask {
            surface: surface.clone(),
            generation,
            chain: self.chain_for(&camera),
            camera,
            settings: self.settings.clone(),
            state: tx,
            token: token.clone(),
            hub: self.hub.clone(),
        };

        tracing::info!(
            surface_id = %surface_id,
            gate_id = ?gate_id,
            session_id = %snapshot.session_id,
            chain_len = session.chain.len(),
            "Starting stream session"
        );

        *active = Some(SessionHandle {
            token,
            task: Some(tokio::spawn(session.run())),
            state: rx,
        });

        snapshot
    }

    /// Stop the surface's session and release the surface
    pub async fn stop(&self, surface_id: &str) -> Option<SessionSnapshot> {
        let surface = self.existing(surface_id).await?;
        let mut active = surface.active.lock().await;
        let handle = active.as_mut()?;
        let snapshot = handle.teardown().await;
        surface.claim();
        Some(snapshot)
    }

    /// Stop every session (page hidden, shutdown)
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.surfaces.read().await.keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            if let Some(snapshot) = self.stop(&id).await {
                if snapshot.state == SessionState::Stopped {
                    stopped += 1;
                }
            }
        }
        stopped
    }

    /// Current session state with derived stats
    pub async fn status(&self, surface_id: &str) -> Option<SessionStatus> {
        let surface = self.existing(surface_id).await?;
        let active = surface.active.lock().await;
        let session = active.as_ref()?.state.borrow().clone();
        let stats = session.stats(Utc::now());
        Some(SessionStatus { session, stats })
    }

    /// Watch state transitions of the surface's current session
    pub async fn subscribe(&self, surface_id: &str) -> Option<watch::Receiver<SessionSnapshot>> {
        let surface = self.existing(surface_id).await?;
        let active = surface.active.lock().await;
        active.as_ref().map(|h| h.state.clone())
    }

    /// Latest attached media of a server-side surface
    pub async fn latest_frame(&self, surface_id: &str) -> Option<MediaSource> {
        self.existing(surface_id).await?.frames.as_ref()?.current()
    }

    /// Number of sessions currently starting or live
    pub async fn active_count(&self) -> usize {
        let surfaces: Vec<Arc<Surface>> = self.surfaces.read().await.values().cloned().collect();
        let mut count = 0;
        for surface in surfaces {
            if let Some(handle) = surface.active.lock().await.as_ref() {
                if !handle.state.borrow().state.is_terminal() {
                    count += 1;
                }
            }
        }
        count
    }
}

// ========================================
// Session task
// ========================================

struct SessionTask {
    surface: Arc<Surface>,
    generation: u64,
    camera: CameraDevice,
    chain: Vec<Arc<dyn StreamTransport>>,
    settings: StreamSettings,
    state: watch::Sender<SessionSnapshot>,
    token: CancellationToken,
    hub: Option<Arc<RealtimeHub>>,
}

impl SessionTask {
    async fn run(self) {
        self.announce().await;

        if self.chain.is_empty() {
            self.end(
                SessionState::Error,
                Some("No streaming protocol supported by this camera".to_string()),
            )
            .await;
            return;
        }

        let max_passes = self.settings.max_passes.max(1);
        let mut last_error = String::new();

        for pass in 1..=max_passes {
            for (index, transport) in self.chain.iter().enumerate() {
                let protocol = transport.protocol();
                self.state.send_modify(|s| {
                    s.pass = pass;
                    s.protocol = Some(protocol);
                    s.attempted.push(protocol);
                });

                tracing::debug!(
                    surface_id = %self.surface.id,
                    protocol = protocol.as_str(),
                    pass,
                    "Trying stream protocol"
                );

                match self.attempt(transport.as_ref()).await {
                    Ok(source) => {
                        self.live(transport.as_ref(), source).await;
                        return;
                    }
                    Err(StreamError::Cancelled) => {
                        self.end(SessionState::Stopped, None).await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            surface_id = %self.surface.id,
                            protocol = protocol.as_str(),
                            pass,
                            error = %e,
                            "Stream attempt failed"
                        );
                        last_error = format!("{}: {}", protocol.as_str(), e);
                        self.state.send_modify(|s| {
                            s.failures += 1;
                            s.last_error = Some(last_error.clone());
                        });

                        let exhausted = pass == max_passes && index + 1 == self.chain.len();
                        if !exhausted && !self.pause(self.settings.backoff).await {
                            self.end(SessionState::Stopped, None).await;
                            return;
                        }
                    }
                }
            }
        }

        self.end(
            SessionState::Error,
            Some(format!(
                "Unable to start live view after {} passes (last: {})",
                max_passes, last_error
            )),
        )
        .await;
    }

    async fn attempt(&self, transport: &dyn StreamTransport) -> Result<MediaSource, StreamError> {
        let limit = self.settings.first_frame_timeout;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StreamError::Cancelled),
            result = tokio::time::timeout(limit, transport.open(&self.camera)) => match result {
                Ok(result) => result,
                Err(_) => Err(StreamError::Timeout(limit)),
            },
        }
    }

    /// Backoff; false when cancelled meanwhile
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn live(&self, transport: &dyn StreamTransport, source: MediaSource) {
        let protocol = source.protocol;
        if !self.surface.attach(self.generation, source) {
            self.end(SessionState::Stopped, None).await;
            return;
        }

        self.state.send_modify(|s| {
            s.state = SessionState::Live;
            s.protocol = Some(protocol);
            s.live_since = Some(Utc::now());
            s.last_error = None;
        });
        self.announce().await;

        tracing::info!(
            surface_id = %self.surface.id,
            protocol = protocol.as_str(),
            failures = self.state.borrow().failures,
            "Stream live"
        );

        let failure = match transport.refresh_interval() {
            Some(period) => self.refresh_loop(transport, period).await,
            None => {
                self.token.cancelled().await;
                None
            }
        };

        match failure {
            Some(message) => self.end(SessionState::Error, Some(message)).await,
            None => self.end(SessionState::Stopped, None).await,
        }
    }

    /// Keep a polling transport fresh. Returns an error message when giving up,
    /// `None` when cancelled.
    async fn refresh_loop(&self, transport: &dyn StreamTransport, period: Duration) -> Option<String> {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let refreshed = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                result = tokio::time::timeout(
                    self.settings.first_frame_timeout,
                    transport.refresh(&self.camera),
                ) => result,
            };

            match refreshed {
                Ok(Ok(source)) => {
                    consecutive = 0;
                    self.surface.attach(self.generation, source);
                }
                Ok(Err(e)) => {
                    consecutive += 1;
                    tracing::debug!(surface_id = %self.surface.id, consecutive, error = %e, "Refresh failed");
                }
                Err(_) => {
                    consecutive += 1;
                    tracing::debug!(surface_id = %self.surface.id, consecutive, "Refresh timed out");
                }
            }

            if consecutive >= self.settings.max_refresh_failures {
                return Some(REFRESH_EXHAUSTED.to_string());
            }
        }
    }

    /// Terminal transition; always releases the surface
    async fn end(&self, state: SessionState, error: Option<String>) {
        self.surface.release(self.generation);

        if let Some(message) = &error {
            tracing::error!(surface_id = %self.surface.id, error = %message, "Stream session failed");
        } else {
            tracing::info!(surface_id = %self.surface.id, "Stream session stopped");
        }

        self.state.send_modify(|s| {
            s.state = state;
            s.live_since = None;
            if error.is_some() {
                s.last_error = error;
            }
        });
        self.announce().await;
    }

    async fn announce(&self) {
        let Some(hub) = &self.hub else {
            return;
        };

        let snapshot = self.state.borrow().clone();
        hub.broadcast(HubMessage::StreamStatus(StreamStatusMessage {
            surface_id: snapshot.surface_id,
            gate_id: snapshot.gate_id,
            state: snapshot.state.as_str().to_string(),
            protocol: snapshot.protocol.map(|p| p.as_str().to_string()),
            message: snapshot.last_error,
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Clone, Copy)]
    enum Behavior {
        Hang,
        Fail,
        Succeed,
        /// Opens fine, every refresh fails
        FlakyRefresh,
    }

    struct MockTransport {
        protocol: StreamProtocol,
        behavior: Behavior,
        supported: bool,
    }

    fn mock(protocol: StreamProtocol, behavior: Behavior) -> Arc<dyn StreamTransport> {
        Arc::new(MockTransport {
            protocol,
            behavior,
            supported: true,
        })
    }

    #[async_trait]
    impl StreamTransport for MockTransport {
        fn protocol(&self) -> StreamProtocol {
            self.protocol
        }

        fn supports(&self, _camera: &CameraDevice) -> bool {
            self.supported
        }

        async fn open(&self, camera: &CameraDevice) -> Result<MediaSource, StreamError> {
            match self.behavior {
                Behavior::Hang => futures::future::pending().await,
                Behavior::Fail => Err(StreamError::Transport("connection refused".into())),
                Behavior::Succeed | Behavior::FlakyRefresh => Ok(MediaSource::new(
                    self.protocol,
                    format!("/{}/{}", self.protocol.as_str(), camera.ip_address),
                    "image/jpeg",
                )
                .with_frame(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]))),
            }
        }

        fn refresh_interval(&self) -> Option<Duration> {
            match self.behavior {
                Behavior::FlakyRefresh => Some(Duration::from_secs(1)),
                _ => None,
            }
        }

        async fn refresh(&self, _camera: &CameraDevice) -> Result<MediaSource, StreamError> {
            Err(StreamError::Transport("snapshot unavailable".into()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl RenderTarget for Recorder {
        fn attach(&self, source: MediaSource) {
            self.events.lock().unwrap().push(format!("attach:{}", source.url));
        }

        fn release(&self) {
            self.events.lock().unwrap().push("release".to_string());
        }
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            first_frame_timeout: Duration::from_secs(8),
            backoff: Duration::from_secs(1),
            max_passes: 3,
            snapshot_interval: Duration::from_millis(1500),
            max_refresh_failures: 5,
            relay_url: None,
        }
    }

    async fn settled(rx: &mut watch::Receiver<SessionSnapshot>, state: SessionState) -> SessionSnapshot {
        rx.wait_for(|s| s.state == state).await.unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_only_camera_goes_live_after_two_failures() {
        let controller = StreamSessionController::new(
            vec![
                mock(StreamProtocol::Relay, Behavior::Hang),
                mock(StreamProtocol::Mjpeg, Behavior::Fail),
                mock(StreamProtocol::Snapshot, Behavior::Succeed),
                mock(StreamProtocol::Hls, Behavior::Succeed),
            ],
            settings(),
        );

        let began = Instant::now();
        let started = controller
            .start("main", Some(1), CameraDevice::new("192.168.1.50"))
            .await;
        assert_eq!(started.state, SessionState::Starting);

        let mut rx = controller.subscribe("main").await.unwrap();
        let live = settled(&mut rx, SessionState::Live).await;

        assert_eq!(live.protocol, Some(StreamProtocol::Snapshot));
        assert_eq!(live.failures, 2);
        assert_eq!(
            live.attempted,
            vec![
                StreamProtocol::Relay,
                StreamProtocol::Mjpeg,
                StreamProtocol::Snapshot
            ]
        );
        // relay timeout plus two backoffs
        assert!(began.elapsed() >= Duration::from_secs(10));

        let frame = controller.latest_frame("main").await.unwrap();
        assert_eq!(frame.protocol, StreamProtocol::Snapshot);

        let status = controller.status("main").await.unwrap();
        assert_eq!(status.stats.fps, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chain_ends_in_error() {
        let controller = StreamSessionController::new(
            vec![
                mock(StreamProtocol::Mjpeg, Behavior::Fail),
                mock(StreamProtocol::Hls, Behavior::Fail),
            ],
            settings(),
        );

        controller
            .start("main", Some(1), CameraDevice::new("192.168.1.50"))
            .await;
        let mut rx = controller.subscribe("main").await.unwrap();
        let failed = settled(&mut rx, SessionState::Error).await;

        assert_eq!(failed.failures, 6);
        assert_eq!(failed.pass, 3);
        assert!(failed.last_error.unwrap().contains("3 passes"));
        assert!(controller.latest_frame("main").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_start_tears_down_previous_session() {
        let controller = StreamSessionController::new(
            vec![mock(StreamProtocol::Mjpeg, Behavior::Succeed)],
            settings(),
        );
        let recorder = Arc::new(Recorder::default());
        controller.register_surface("main", recorder.clone()).await;

        controller
            .start("main", Some(1), CameraDevice::new("10.0.0.1"))
            .await;
        let mut first = controller.subscribe("main").await.unwrap();
        settled(&mut first, SessionState::Live).await;

        controller
            .start("main", Some(2), CameraDevice::new("10.0.0.2"))
            .await;
        assert_eq!(first.borrow().state, SessionState::Stopped);

        let mut second = controller.subscribe("main").await.unwrap();
        settled(&mut second, SessionState::Live).await;

        assert_eq!(
            recorder.events(),
            vec![
                "attach:/mjpeg/10.0.0.1".to_string(),
                "release".to_string(),
                "attach:/mjpeg/10.0.0.2".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_starting() {
        let controller = StreamSessionController::new(
            vec![mock(StreamProtocol::Relay, Behavior::Hang)],
            settings(),
        );

        controller
            .start("main", None, CameraDevice::new("10.0.0.1"))
            .await;
        let stopped = controller.stop("main").await.unwrap();

        assert_eq!(stopped.state, SessionState::Stopped);
        assert_eq!(stopped.failures, 0);
        assert_eq!(controller.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_refresh_failures_release_surface() {
        let controller = StreamSessionController::new(
            vec![mock(StreamProtocol::Snapshot, Behavior::FlakyRefresh)],
            settings(),
        );
        let recorder = Arc::new(Recorder::default());
        controller.register_surface("main", recorder.clone()).await;

        controller
            .start("main", Some(1), CameraDevice::new("10.0.0.1"))
            .await;
        let mut rx = controller.subscribe("main").await.unwrap();
        let failed = settled(&mut rx, SessionState::Error).await;

        assert_eq!(failed.last_error.as_deref(), Some(REFRESH_EXHAUSTED));
        assert_eq!(recorder.events().last().map(String::as_str), Some("release"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_protocols_are_skipped() {
        let unsupported: Arc<dyn StreamTransport> = Arc::new(MockTransport {
            protocol: StreamProtocol::Mjpeg,
            behavior: Behavior::Succeed,
            supported: false,
        });
        let controller = StreamSessionController::new(
            vec![unsupported, mock(StreamProtocol::Snapshot, Behavior::Succeed)],
            settings(),
        );

        controller
            .start("main", Some(1), CameraDevice::new("10.0.0.1"))
            .await;
        let mut rx = controller.subscribe("main").await.unwrap();
        let live = settled(&mut rx, SessionState::Live).await;

        assert_eq!(live.failures, 0);
        assert_eq!(live.attempted, vec![StreamProtocol::Snapshot]);
    }
}
