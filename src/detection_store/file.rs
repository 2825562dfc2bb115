//! JSON-file store: `<root>/<scope>/<key>.json`, written via temp file + rename

use super::KvStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// FileStore instance
pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create new FileStore, creating the root directory
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::Storage(format!("create {}: {}", root.display(), e)))?;

        tracing::info!(root = %root.display(), "FileStore initialized");

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, scope: &str, key: &str) -> PathBuf {
        self.root
            .join(sanitize(scope))
            .join(format!("{}.json", sanitize(key)))
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>> {
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| Error::Storage(format!("corrupt {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("read {}: {}", path.display(), e))),
        }
    }

    async fn write(&self, path: &Path, value: &Value) -> Result<()> {
        let storage_err = |e: std::io::Error| Error::Storage(format!("write {}: {}", path.display(), e));

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(storage_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, json).await.map_err(storage_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        self.read(&self.path_for(scope, key)).await
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(&self.path_for(scope, key), &value).await
    }

    async fn append(&self, scope: &str, key: &str, item: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(scope, key);
        let mut items = match self.read(&path).await? {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(Error::Storage(format!("{}/{} is not a list", scope, key))),
        };
        items.push(item);
        self.write(&path, &Value::Array(items)).await
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(scope, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }
}
