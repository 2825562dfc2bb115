//! DetectionPoller - Per-Gate Detection Polling & Dedup
//!
//! ## Responsibilities
//!
//! - One cancellable polling task per gate (single owned handle)
//! - Cursor-based dedup: only ids above the gate cursor are queued
//! - Cursor advanced only after every new entry is durably queued
//! - In-flight poll cancelled when a new poll is triggered; each fetch is
//!   bounded below the polling interval so a slow source still reports
//! - Cursor never moves backwards, whichever poll commits last
//! - Pause while the dashboard is hidden, poll immediately when visible
//! - Listener notification and operator resolution of queued entries
//!
//! The cursor and pending queue of a gate are mutated only through this
//! engine. Polling is per gate: two gates sharing one camera each keep
//! their own cursor and queue.

mod types;

pub use types::*;

use crate::camera_status_tracker::{CameraStatusEvent, CameraStatusTracker};
use crate::detection_source::DetectionSource;
use crate::detection_store::{GateStore, PendingDetection, PendingStatus};
use crate::error::{Error, Result};
use crate::gate_registry::{GateConfig, GateId};
use crate::passage_client::{ConfirmRequest, PassageClient, PassageSubmission};
use crate::realtime_hub::{
    CameraStatusMessage, DetectionsQueuedMessage, HubMessage, PollErrorMessage, RealtimeHub,
};
use crate::state::PollingSettings;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A submission started longer ago than this is no longer in flight
const PROCESSING_STALE_AFTER_SECS: i64 = 120;

/// Owned handle of one gate's polling task
struct GatePoller {
    token: CancellationToken,
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
}

struct EngineInner {
    source: Arc<dyn DetectionSource>,
    store: Arc<GateStore>,
    hub: Arc<RealtimeHub>,
    tracker: Arc<CameraStatusTracker>,
    interval: Duration,
    fetch_timeout: Duration,
    events: broadcast::Sender<DetectionEvent>,
    visibility: watch::Sender<bool>,
    statuses: RwLock<HashMap<GateId, PollStatus>>,
    /// Held across each commit (and across a whole inline poll)
    gate_locks: Mutex<HashMap<GateId, Arc<Mutex<()>>>>,
}

/// DetectionPollingEngine instance
pub struct DetectionPollingEngine {
    inner: Arc<EngineInner>,
    pollers: Mutex<HashMap<GateId, GatePoller>>,
}

impl DetectionPollingEngine {
    /// Create new DetectionPollingEngine. Starts visible.
    pub fn new(
        source: Arc<dyn DetectionSource>,
        store: Arc<GateStore>,
        hub: Arc<RealtimeHub>,
        tracker: Arc<CameraStatusTracker>,
        settings: &PollingSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (visibility, _) = watch::channel(true);

        Self {
            inner: Arc::new(EngineInner {
                source,
                store,
                hub,
                tracker,
                interval: settings.interval,
                fetch_timeout: settings.fetch_timeout.min(settings.interval * 3 / 4),
                events,
                visibility,
                statuses: RwLock::new(HashMap::new()),
                gate_locks: Mutex::new(HashMap::new()),
            }),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the polling task for a gate
    pub async fn start_gate(&self, gate: GateConfig) -> Result<()> {
        if gate.camera.is_none() {
            return Err(Error::Validation(format!(
                "gate {} has no camera configured",
                gate.gate_id
            )));
        }

        let gate_id = gate.gate_id;
        let mut pollers = self.pollers.lock().await;
        if let Some(previous) = pollers.remove(&gate_id) {
            previous.token.cancel();
            let _ = previous.task.await;
        }

        let token = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        self.inner.set_running(gate_id, true).await;

        let task = tokio::spawn(run_gate(
            self.inner.clone(),
            gate,
            token.clone(),
            trigger.clone(),
        ));
        pollers.insert(
            gate_id,
            GatePoller {
                token,
                trigger,
                task,
            },
        );

        tracing::info!(
            gate_id = gate_id,
            interval_ms = self.inner.interval.as_millis() as u64,
            "Detection polling started"
        );
        Ok(())
    }

    /// Stop one gate's polling. Returns false when it was not running.
    pub async fn stop_gate(&self, gate_id: GateId) -> bool {
        let poller = self.pollers.lock().await.remove(&gate_id);
        match poller {
            Some(poller) => {
                poller.token.cancel();
                let _ = poller.task.await;
                self.inner.set_running(gate_id, false).await;
                self.inner.tracker.remove(gate_id).await;
                tracing::info!(gate_id = gate_id, "Detection polling stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every gate (shutdown)
    pub async fn stop_all(&self) {
        let drained: Vec<(GateId, GatePoller)> = self.pollers.lock().await.drain().collect();
        for (gate_id, poller) in drained {
            poller.token.cancel();
            let _ = poller.task.await;
            self.inner.set_running(gate_id, false).await;
        }
    }

    pub async fn running_gates(&self) -> Vec<GateId> {
        let mut gates: Vec<GateId> = self.pollers.lock().await.keys().copied().collect();
        gates.sort_unstable();
        gates
    }

    /// Poll now; a poll already in flight for this gate is abandoned
    pub async fn trigger(&self, gate_id: GateId) -> Result<()> {
        let pollers = self.pollers.lock().await;
        let poller = pollers
            .get(&gate_id)
            .ok_or_else(|| Error::NotFound(format!("no poller running for gate {}", gate_id)))?;
        poller.trigger.notify_one();
        Ok(())
    }

    /// Dashboard visibility. Hidden pauses every poller; visible resumes
    /// them with an immediate poll.
    pub fn set_visible(&self, visible: bool) {
        let previous = self.inner.visibility.send_replace(visible);
        if previous != visible {
            tracing::info!(visible = visible, "Detection polling visibility changed");
        }
    }

    pub fn is_visible(&self) -> bool {
        *self.inner.visibility.borrow()
    }

    /// Listener for newly queued entries
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.inner.events.subscribe()
    }

    /// Run one poll inline. Rejected while the gate's task is running;
    /// concurrent inline polls of one gate run one after the other.
    pub async fn poll_once(&self, gate: &GateConfig) -> Result<PollOutcome> {
        if self.pollers.lock().await.contains_key(&gate.gate_id) {
            return Err(Error::Conflict(format!(
                "gate {} is polled by its background task",
                gate.gate_id
            )));
        }

        let lock = self.inner.gate_lock(gate.gate_id).await;
        let _in_flight = lock.lock().await;

        let fetched = self.inner.timed_fetch(gate).await;
        self.inner
            .finish_poll(gate, fetched)
            .await
            .map_err(|e| match e {
                PollError::Fetch(inner) | PollError::Persist(inner) => inner,
            })
    }

    /// Status snapshot, cursor read from storage
    pub async fn status(&self, gate_id: GateId) -> Result<PollStatus> {
        let mut status = self
            .inner
            .statuses
            .read()
            .await
            .get(&gate_id)
            .cloned()
            .unwrap_or_else(|| PollStatus {
                gate_id,
                ..Default::default()
            });
        status.cursor = self.inner.store.cursor(gate_id).await?;
        status.camera = self.inner.tracker.get_status(gate_id).await;
        Ok(status)
    }

    // ========================================
    // Operator resolution
    // ========================================

    /// Pending queue in arrival order
    pub async fn pending(&self, gate_id: GateId) -> Result<Vec<PendingDetection>> {
        self.inner.store.pending(gate_id).await
    }

    /// Return submissions interrupted by a restart to `pending`.
    ///
    /// Nothing is in flight before the server starts serving, so every
    /// `processing` entry of the given gates is reset.
    pub async fn recover_interrupted<I>(&self, gate_ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = GateId>,
    {
        let cutoff = Utc::now();
        let mut total = 0;
        for gate_id in gate_ids {
            let released = self.inner.store.release_processing(gate_id, cutoff).await?;
            if !released.is_empty() {
                tracing::warn!(
                    gate_id = gate_id,
                    detection_ids = ?released,
                    "Interrupted submissions returned to pending"
                );
            }
            total += released.len();
        }
        Ok(total)
    }

    async fn release_stale(&self, gate_id: GateId) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(PROCESSING_STALE_AFTER_SECS);
        let released = self.inner.store.release_processing(gate_id, cutoff).await?;
        if !released.is_empty() {
            tracing::warn!(
                gate_id = gate_id,
                detection_ids = ?released,
                "Stale submissions returned to pending"
            );
        }
        Ok(())
    }

    /// Oldest entry not already being submitted
    pub async fn next_pending(&self, gate_id: GateId) -> Result<Option<PendingDetection>> {
        self.release_stale(gate_id).await?;
        Ok(self
            .pending(gate_id)
            .await?
            .into_iter()
            .find(|e| e.status == PendingStatus::Pending))
    }

    pub async fn set_vehicle_type(
        &self,
        gate_id: GateId,
        detection_id: u64,
        vehicle_type_id: i64,
    ) -> Result<PendingDetection> {
        self.inner
            .store
            .update_pending(gate_id, detection_id, |entry| {
                entry.vehicle_type_id = Some(vehicle_type_id)
            })
            .await
    }

    /// Drop an entry without committing it
    pub async fn discard(&self, gate_id: GateId, detection_id: u64) -> Result<PendingDetection> {
        let removed = self
            .inner
            .store
            .remove_pending(gate_id, detection_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("detection {} on gate {}", detection_id, gate_id))
            })?;
        tracing::info!(gate_id = gate_id, detection_id = detection_id, "Pending detection discarded");
        Ok(removed)
    }

    /// Submit an entry to the backend; removed from the queue only on success
    pub async fn confirm(
        &self,
        gate_id: GateId,
        detection_id: u64,
        request: &ConfirmRequest,
        passages: &PassageClient,
    ) -> Result<(PendingDetection, serde_json::Value)> {
        self.release_stale(gate_id).await?;
        let current = self
            .pending(gate_id)
            .await?
            .into_iter()
            .find(|e| e.id() == detection_id)
            .ok_or_else(|| {
                Error::NotFound(format!("detection {} on gate {}", detection_id, gate_id))
            })?;
        if current.status == PendingStatus::Processing {
            return Err(Error::Conflict(format!(
                "detection {} is already being submitted",
                detection_id
            )));
        }
        let submission = PassageSubmission::from_pending(&current, request)?;

        let body_type_id = request.body_type_id;
        let entry = self
            .inner
            .store
            .update_pending(gate_id, detection_id, move |entry| {
                entry.mark_processing(Utc::now());
                if body_type_id.is_some() {
                    entry.vehicle_type_id = body_type_id;
                }
            })
            .await?;

        match passages.submit(&submission).await {
            Ok(response) => {
                // The backend already has the passage
                if let Err(e) = self.inner.store.remove_pending(gate_id, detection_id).await {
                    tracing::error!(
                        gate_id = gate_id,
                        detection_id = detection_id,
                        error = %e,
                        "Submitted detection could not be removed from the queue"
                    );
                }
                Ok((entry, response))
            }
            Err(e) => {
                self.inner
                    .store
                    .update_pending(gate_id, detection_id, |entry| entry.mark_pending())
                    .await?;
                Err(e)
            }
        }
    }
}

impl EngineInner {
    async fn set_running(&self, gate_id: GateId, running: bool) {
        let mut statuses = self.statuses.write().await;
        let status = statuses.entry(gate_id).or_insert_with(|| PollStatus {
            gate_id,
            ..Default::default()
        });
        status.running = running;
    }

    async fn gate_lock(&self, gate_id: GateId) -> Arc<Mutex<()>> {
        self.gate_locks
            .lock()
            .await
            .entry(gate_id)
            .or_default()
            .clone()
    }

    /// Fetch bounded by `fetch_timeout`; expiry is a failed poll
    async fn timed_fetch(&self, gate: &GateConfig) -> std::result::Result<Fetched, PollError> {
        match tokio::time::timeout(self.fetch_timeout, self.fetch_phase(gate)).await {
            Ok(fetched) => fetched,
            Err(_) => Err(PollError::Fetch(Error::Upstream(format!(
                "detection fetch timed out after {} ms",
                self.fetch_timeout.as_millis()
            )))),
        }
    }

    /// Steps 1-3: read cursor, optional latest-id probe, fetch
    async fn fetch_phase(&self, gate: &GateConfig) -> std::result::Result<Fetched, PollError> {
        let cursor = self
            .store
            .cursor(gate.gate_id)
            .await
            .map_err(PollError::Persist)?;

        match self.source.latest_id(gate).await {
            Ok(Some(latest)) if latest <= cursor => {
                return Ok(Fetched::Unchanged { cursor });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(gate_id = gate.gate_id, error = %e, "Latest-id probe failed, doing full fetch");
            }
        }

        let records = self.source.fetch(gate).await.map_err(PollError::Fetch)?;
        Ok(Fetched::Batch { cursor, records })
    }

    /// Steps 3-6: partition, queue, advance cursor, notify
    async fn commit_phase(
        &self,
        gate: &GateConfig,
        cursor: u64,
        records: Vec<crate::detection_source::DetectionRecord>,
    ) -> std::result::Result<PollOutcome, PollError> {
        // Another poll may have committed since this one read the cursor
        let stored = self
            .store
            .cursor(gate.gate_id)
            .await
            .map_err(PollError::Persist)?;
        let cursor = cursor.max(stored);

        let fetched = records.len();
        let mut fresh: Vec<_> = records.into_iter().filter(|d| d.id > cursor).collect();
        fresh.sort_by_key(|d| d.id);
        fresh.dedup_by_key(|d| d.id);

        let Some(new_cursor) = fresh.last().map(|d| d.id) else {
            return Ok(PollOutcome {
                gate_id: gate.gate_id,
                fetched,
                queued: Vec::new(),
                cursor,
                unchanged: false,
            });
        };

        let mut queued = Vec::new();
        for record in fresh {
            let entry = PendingDetection::new(record, gate);
            if self
                .store
                .append_pending(&entry)
                .await
                .map_err(PollError::Persist)?
            {
                queued.push(entry);
            }
        }

        self.store
            .set_cursor(gate.gate_id, new_cursor)
            .await
            .map_err(PollError::Persist)?;

        tracing::debug!(
            gate_id = gate.gate_id,
            fetched = fetched,
            queued = queued.len(),
            cursor = new_cursor,
            "Detection batch committed"
        );

        let queued_ids: Vec<u64> = queued.iter().map(|e| e.id()).collect();
        if !queued.is_empty() {
            tracing::info!(
                gate_id = gate.gate_id,
                count = queued.len(),
                cursor = new_cursor,
                "New detections queued"
            );
            self.hub
                .broadcast(HubMessage::DetectionsQueued(DetectionsQueuedMessage {
                    gate_id: gate.gate_id,
                    detection_ids: queued_ids.clone(),
                    plates: queued
                        .iter()
                        .map(|e| e.detection.plate_number.clone())
                        .collect(),
                    cursor: new_cursor,
                    timestamp: Utc::now().to_rfc3339(),
                }))
                .await;
            // No receivers is fine
            let _ = self.events.send(DetectionEvent {
                gate_id: gate.gate_id,
                entries: queued,
                cursor: new_cursor,
            });
        }

        Ok(PollOutcome {
            gate_id: gate.gate_id,
            fetched,
            queued: queued_ids,
            cursor: new_cursor,
            unchanged: false,
        })
    }

    /// Commit a fetch result and record status. Never cancelled.
    async fn finish_poll(
        &self,
        gate: &GateConfig,
        fetched: std::result::Result<Fetched, PollError>,
    ) -> std::result::Result<PollOutcome, PollError> {
        let result = match fetched {
            Ok(Fetched::Unchanged { cursor }) => {
                self.camera_reachable(gate.gate_id, true).await;
                Ok(PollOutcome {
                    gate_id: gate.gate_id,
                    fetched: 0,
                    queued: Vec::new(),
                    cursor,
                    unchanged: true,
                })
            }
            Ok(Fetched::Batch { cursor, records }) => {
                self.camera_reachable(gate.gate_id, true).await;
                self.commit_phase(gate, cursor, records).await
            }
            Err(e) => {
                if matches!(e, PollError::Fetch(_)) {
                    self.camera_reachable(gate.gate_id, false).await;
                }
                Err(e)
            }
        };

        self.record(gate.gate_id, &result).await;
        result
    }

    async fn record(&self, gate_id: GateId, result: &std::result::Result<PollOutcome, PollError>) {
        let now = Utc::now();
        {
            let mut statuses = self.statuses.write().await;
            let status = statuses.entry(gate_id).or_insert_with(|| PollStatus {
                gate_id,
                ..Default::default()
            });
            status.polls += 1;
            status.last_poll_at = Some(now);
            match result {
                Ok(outcome) => {
                    status.cursor = outcome.cursor;
                    status.queued_total += outcome.queued.len() as u64;
                    status.last_success_at = Some(now);
                    status.last_error = None;
                }
                Err(e) => status.last_error = Some(e.to_string()),
            }
        }

        if let Err(e) = result {
            tracing::warn!(gate_id = gate_id, error = %e, "Detection poll failed");
            self.hub
                .broadcast(HubMessage::PollError(PollErrorMessage {
                    gate_id,
                    message: e.to_string(),
                    timestamp: now.to_rfc3339(),
                }))
                .await;
        }
    }

    async fn camera_reachable(&self, gate_id: GateId, online: bool) {
        let Some(event) = self.tracker.update_status(gate_id, online).await else {
            return;
        };
        self.hub
            .broadcast(HubMessage::CameraStatus(CameraStatusMessage {
                gate_id,
                online: event == CameraStatusEvent::Recovered,
                timestamp: Utc::now().to_rfc3339(),
            }))
            .await;
    }

    /// One poll, restarted whenever a newer poll is requested before the
    /// fetch completes. Returns false once the gate is cancelled.
    async fn poll_cycle(
        &self,
        gate: &GateConfig,
        token: &CancellationToken,
        trigger: &Notify,
        ticker: &mut Interval,
        visible: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                changed = visible.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    if !*visible.borrow() {
                        tracing::debug!(gate_id = gate.gate_id, "In-flight poll abandoned (hidden)");
                        return true;
                    }
                    continue;
                }
                _ = trigger.notified() => {
                    tracing::debug!(gate_id = gate.gate_id, "In-flight poll superseded by trigger");
                    continue;
                }
                _ = ticker.tick() => {
                    tracing::debug!(gate_id = gate.gate_id, "In-flight poll superseded by timer");
                    continue;
                }
                fetched = self.timed_fetch(gate) => fetched,
            };

            let lock = self.gate_lock(gate.gate_id).await;
            let _commit = lock.lock().await;
            let _ = self.finish_poll(gate, fetched).await;
            return true;
        }
    }
}

/// Wait until visible; false if cancelled first
async fn wait_until_visible(
    visible: &mut watch::Receiver<bool>,
    token: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = token.cancelled() => return false,
            changed = visible.changed() => {
                if changed.is_err() {
                    return false;
                }
                if *visible.borrow_and_update() {
                    return true;
                }
            }
        }
    }
}

async fn run_gate(
    inner: Arc<EngineInner>,
    gate: GateConfig,
    token: CancellationToken,
    trigger: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(inner.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut visible = inner.visibility.subscribe();

    loop {
        if !*visible.borrow_and_update() {
            tracing::debug!(gate_id = gate.gate_id, "Polling paused");
            if !wait_until_visible(&mut visible, &token).await {
                break;
            }
            tracing::debug!(gate_id = gate.gate_id, "Polling resumed");
            ticker.reset();
        } else {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                changed = visible.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = trigger.notified() => {}
                _ = ticker.tick() => {}
            }
        }

        if !inner
            .poll_cycle(&gate, &token, &trigger, &mut ticker, &mut visible)
            .await
        {
            break;
        }
    }

    tracing::debug!(gate_id = gate.gate_id, "Gate polling task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_source::DetectionRecord;
    use crate::detection_store::MemoryStore;
    use async_trait::async_trait;

    struct EmptySource;

    #[async_trait]
    impl DetectionSource for EmptySource {
        async fn fetch(&self, _gate: &GateConfig) -> Result<Vec<DetectionRecord>> {
            Ok(Vec::new())
        }
    }

    fn record(id: u64) -> DetectionRecord {
        DetectionRecord {
            id,
            plate_raw: format!("p{}", id),
            plate_number: format!("P{}", id),
            confidence: None,
            lane: None,
            direction: None,
            captured_at: None,
            gate_id: None,
        }
    }

    fn engine() -> DetectionPollingEngine {
        DetectionPollingEngine::new(
            Arc::new(EmptySource),
            Arc::new(GateStore::new(Arc::new(MemoryStore::new()))),
            Arc::new(RealtimeHub::new()),
            Arc::new(CameraStatusTracker::new()),
            &PollingSettings {
                enabled: true,
                interval: Duration::from_secs(4),
                fetch_timeout: Duration::from_secs(10),
                source: crate::state::DetectionSourceKind::Camera,
            },
        )
    }

    #[tokio::test]
    async fn test_commit_with_older_cursor_does_not_lower_it() {
        let engine = engine();
        let gate = GateConfig::new(1, "A");
        engine.inner.store.set_cursor(1, 5).await.unwrap();

        // fetched when the cursor was still 2
        let outcome = engine
            .inner
            .commit_phase(&gate, 2, vec![record(3), record(4)])
            .await
            .unwrap();
        assert!(outcome.queued.is_empty());
        assert_eq!(outcome.cursor, 5);
        assert_eq!(engine.inner.store.cursor(1).await.unwrap(), 5);

        let outcome = engine
            .inner
            .commit_phase(&gate, 2, vec![record(4), record(6)])
            .await
            .unwrap();
        assert_eq!(outcome.queued, vec![6]);
        assert_eq!(engine.inner.store.cursor(1).await.unwrap(), 6);
    }

    #[test]
    fn test_fetch_timeout_stays_below_interval() {
        assert_eq!(engine().inner.fetch_timeout, Duration::from_secs(3));
    }
}
