//! Embedded SQLite store

use super::KvStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

/// SqliteStore instance
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) and migrate
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Every in-memory connection is its own database: pin to one.
        let in_memory = url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 4 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (scope, key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        tracing::info!(in_memory = in_memory, "SqliteStore initialized");

        Ok(Self { pool })
    }
}

fn decode(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| Error::Storage(format!("corrupt kv value: {}", e)))
}

const UPSERT: &str = r#"
    INSERT INTO kv_entries (scope, key, value, updated_at)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
"#;

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE scope = ? AND key = ?")
            .bind(scope)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("value");
                decode(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<()> {
        sqlx::query(UPSERT)
            .bind(scope)
            .bind(key)
            .bind(value.to_string())
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append(&self, scope: &str, key: &str, item: Value) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT value FROM kv_entries WHERE scope = ? AND key = ?")
            .bind(scope)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

        let mut items = match row {
            None => Vec::new(),
            Some(row) => {
                let raw: String = row.get("value");
                match decode(&raw)? {
                    Value::Array(items) => items,
                    _ => return Err(Error::Storage(format!("{}/{} is not a list", scope, key))),
                }
            }
        };
        items.push(item);

        sqlx::query(UPSERT)
            .bind(scope)
            .bind(key)
            .bind(Value::Array(items).to_string())
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE scope = ? AND key = ?")
            .bind(scope)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();

        assert_eq!(store.get("gate:1", "cursor").await.unwrap(), None);
        store.set("gate:1", "cursor", json!(3)).await.unwrap();
        store.set("gate:1", "cursor", json!(4)).await.unwrap();
        assert_eq!(store.get("gate:1", "cursor").await.unwrap(), Some(json!(4)));

        store.append("gate:1", "pending", json!({"id": 1})).await.unwrap();
        store.append("gate:1", "pending", json!({"id": 2})).await.unwrap();
        assert_eq!(
            store.get("gate:1", "pending").await.unwrap(),
            Some(json!([{"id": 1}, {"id": 2}]))
        );

        store.remove("gate:1", "pending").await.unwrap();
        assert_eq!(store.get("gate:1", "pending").await.unwrap(), None);
    }
}
