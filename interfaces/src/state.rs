use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;

use crate::defs::KeyValueStore;

/// Session store backed by a single sqlite table.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Accepts any sqlx sqlite URL, e.g. `sqlite://sessions.db` or
    /// `sqlite::memory:`. The database file is created when missing.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // One connection: an in-memory database only exists per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS kv_entries (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL
                )
            ",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "
                INSERT INTO kv_entries (key, value)
                VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local store, used when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().await.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn KeyValueStore) -> Result<()> {
        assert_eq!(store.get("user:1").await?, None);

        store.set("user:1", r#"{"id":"1"}"#).await?;
        assert_eq!(store.get("user:1").await?.as_deref(), Some(r#"{"id":"1"}"#));

        store.set("user:1", r#"{"id":"1","v":2}"#).await?;
        assert_eq!(store.get("user:1").await?.as_deref(), Some(r#"{"id":"1","v":2}"#));

        assert!(store.delete("user:1").await?);
        assert!(!store.delete("user:1").await?);
        assert_eq!(store.get("user:1").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_round_trip() -> Result<()> {
        exercise(&MemoryStore::new()).await
    }

    #[tokio::test]
    async fn sqlite_store_round_trip() -> Result<()> {
        let store = SqliteStore::connect("sqlite::memory:").await?;
        exercise(&store).await
    }

    #[tokio::test]
    async fn sqlite_store_persists_to_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite://{}", dir.path().join("sessions.db").display());

        {
            let store = SqliteStore::connect(&url).await?;
            store.set("message:chat:7", "{}").await?;
        }
        let reopened = SqliteStore::connect(&url).await?;
        assert_eq!(reopened.get("message:chat:7").await?.as_deref(), Some("{}"));
        Ok(())
    }
}
