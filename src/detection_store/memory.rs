//! In-process store (tests, or when durability is not wanted)

use super::KvStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// MemoryStore instance
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(String, String), Value>>,
}

impl MemoryStore {
    /// Create new MemoryStore
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(scope.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert((scope.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn append(&self, scope: &str, key: &str, item: Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        let slot = entries
            .entry((scope.to_string(), key.to_string()))
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => {
                items.push(item);
                Ok(())
            }
            _ => Err(Error::Storage(format!("{}/{} is not a list", scope, key))),
        }
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .remove(&(scope.to_string(), key.to_string()));
        Ok(())
    }
}
