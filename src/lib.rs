//! Gate Camserver Library
//!
//! Live camera ingestion for parking gate operations.
//!
//! ## Architecture
//!
//! 1. GateRegistry - Gate and camera configuration (read-only)
//! 2. CameraProxy - Allowlisted, authenticated camera gateway
//! 3. StreamSessionController - Protocol fallback per render surface
//! 4. DetectionSource - Camera log / backend detection batches
//! 5. DetectionStore - Durable per-gate cursor and pending queue
//! 6. DetectionPollingEngine - Per-gate polling and dedup
//! 7. PassageClient - Operator-confirmed submissions to the backend
//! 8. RealtimeHub - WebSocket distribution
//! 9. WebAPI - REST API endpoints
//!
//! ## Design Principles
//!
//! - Polling never commits anything to the backend; operators do
//! - A gate's cursor never passes an entry that is not durably queued
//! - One session owns a render surface at a time

pub mod camera_proxy;
pub mod camera_status_tracker;
pub mod detection_poller;
pub mod detection_source;
pub mod detection_store;
pub mod error;
pub mod gate_registry;
pub mod models;
pub mod passage_client;
pub mod realtime_hub;
pub mod state;
pub mod stream_session;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
