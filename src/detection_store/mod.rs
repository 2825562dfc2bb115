//! DetectionStore - Durable Per-Gate Cursor and Pending Queue
//!
//! ## Responsibilities
//!
//! - Swappable key-value engine (`KvStore`: memory, JSON files, SQLite)
//! - Typed per-gate view (`GateStore`): dedup cursor and pending queue
//! - Idempotent queue insertion by detection id
//!
//! Layout: scope `gate:<id>`, keys `cursor` (u64) and `pending` (list of
//! `{ detection, gate_id, direction, received_at, ... }`).

mod file;
mod memory;
mod sqlite;
mod types;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::*;

use crate::error::{Error, Result};
use crate::gate_registry::GateId;
use crate::state::StorageBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

const CURSOR_KEY: &str = "cursor";
const PENDING_KEY: &str = "pending";

/// Scoped key-value storage over JSON values
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>>;

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<()>;

    /// Append to the list stored at `key`, creating it when absent
    async fn append(&self, scope: &str, key: &str, item: Value) -> Result<()>;

    async fn remove(&self, scope: &str, key: &str) -> Result<()>;
}

/// Open the configured storage engine
pub async fn open_store(backend: &StorageBackend) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory detection store; pending queues will not survive restart");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::File(root) => Arc::new(FileStore::new(root.clone()).await?),
        StorageBackend::Sqlite(url) => Arc::new(SqliteStore::connect(url).await?),
    };
    Ok(store)
}

fn gate_scope(gate_id: GateId) -> String {
    format!("gate:{}", gate_id)
}

/// Typed per-gate view over a `KvStore`
pub struct GateStore {
    kv: Arc<dyn KvStore>,
    /// Queue read-modify-write is serialized (poller vs. operator actions)
    queue_lock: Mutex<()>,
}

impl GateStore {
    /// Create new GateStore
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            queue_lock: Mutex::new(()),
        }
    }

    /// Highest processed detection id, 0 when nothing processed yet
    pub async fn cursor(&self, gate_id: GateId) -> Result<u64> {
        match self.kv.get(&gate_scope(gate_id), CURSOR_KEY).await? {
            None => Ok(0),
            Some(value) => value.as_u64().ok_or_else(|| {
                Error::Storage(format!("gate {} cursor is not an integer", gate_id))
            }),
        }
    }

    pub async fn set_cursor(&self, gate_id: GateId, cursor: u64) -> Result<()> {
        self.kv
            .set(&gate_scope(gate_id), CURSOR_KEY, Value::from(cursor))
            .await
    }

    async fn load_pending(&self, gate_id: GateId) -> Result<Vec<PendingDetection>> {
        let items = match self.kv.get(&gate_scope(gate_id), PENDING_KEY).await? {
            None => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(Error::Storage(format!(
                    "gate {} pending queue is not a list",
                    gate_id
                )))
            }
        };

        // An unreadable entry fails the whole load: a later write-back
        // would otherwise drop it.
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                serde_json::from_value::<PendingDetection>(item).map_err(|e| {
                    Error::Storage(format!(
                        "gate {} pending entry {} is unreadable: {}",
                        gate_id, index, e
                    ))
                })
            })
            .collect()
    }

    async fn save_pending(&self, gate_id: GateId, entries: &[PendingDetection]) -> Result<()> {
        let value = serde_json::to_value(entries)?;
        self.kv.set(&gate_scope(gate_id), PENDING_KEY, value).await
    }

    /// Queue in arrival order
    pub async fn pending(&self, gate_id: GateId) -> Result<Vec<PendingDetection>> {
        self.load_pending(gate_id).await
    }

    /// Append unless an entry with the same detection id is queued.
    ///
    /// Returns whether the entry was inserted.
    pub async fn append_pending(&self, entry: &PendingDetection) -> Result<bool> {
        let _guard = self.queue_lock.lock().await;

        let existing = self.load_pending(entry.gate_id).await?;
        if existing.iter().any(|e| e.id() == entry.id()) {
            return Ok(false);
        }

        self.kv
            .append(
                &gate_scope(entry.gate_id),
                PENDING_KEY,
                serde_json::to_value(entry)?,
            )
            .await?;
        Ok(true)
    }

    /// Apply `update` to one entry and persist
    pub async fn update_pending<F>(
        &self,
        gate_id: GateId,
        detection_id: u64,
        update: F,
    ) -> Result<PendingDetection>
    where
        F: FnOnce(&mut PendingDetection) + Send,
    {
        let _guard = self.queue_lock.lock().await;

        let mut entries = self.load_pending(gate_id).await?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id() == detection_id)
            .ok_or_else(|| {
                Error::NotFound(format!("detection {} on gate {}", detection_id, gate_id))
            })?;
        update(entry);
        let updated = entry.clone();

        self.save_pending(gate_id, &entries).await?;
        Ok(updated)
    }

    /// Return interrupted submissions to `pending`.
    ///
    /// Every `processing` entry whose submission started before `cutoff`
    /// is reset; returns the ids that were reset.
    pub async fn release_processing(
        &self,
        gate_id: GateId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<u64>> {
        let _guard = self.queue_lock.lock().await;

        let mut entries = self.load_pending(gate_id).await?;
        let mut released = Vec::new();
        for entry in entries.iter_mut().filter(|e| e.is_stale_processing(cutoff)) {
            entry.mark_pending();
            released.push(entry.id());
        }

        if !released.is_empty() {
            self.save_pending(gate_id, &entries).await?;
        }
        Ok(released)
    }

    /// Remove one entry; `None` when it was not queued
    pub async fn remove_pending(
        &self,
        gate_id: GateId,
        detection_id: u64,
    ) -> Result<Option<PendingDetection>> {
        let _guard = self.queue_lock.lock().await;

        let mut entries = self.load_pending(gate_id).await?;
        let Some(pos) = entries.iter().position(|e| e.id() == detection_id) else {
            return Ok(None);
        };
        let removed = entries.remove(pos);

        if entries.is_empty() {
            self.kv.remove(&gate_scope(gate_id), PENDING_KEY).await?;
        } else {
            self.save_pending(gate_id, &entries).await?;
        }
        Ok(Some(removed))
    }
}
