//! SQLite-backed store for large records.

use async_trait::async_trait;
use chrono::DateTime;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::traits::{CacheBackend, CachedRecord};

/// SQLite-based cache storage implementation.
///
/// Queries run on the blocking thread pool so bulk payloads never stall the
/// async executor.
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn)
    })
    .await
    .map_err(|e| eyre!("Cache database task failed: {}", e))?
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per namespaced endpoint key
CREATE TABLE IF NOT EXISTS endpoint_cache (
    key_hash TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL,
    data BLOB NOT NULL,
    last_updated INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SHA256 hash for stable, fixed-length row keys.
fn key_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

#[async_trait]
impl CacheBackend for SqliteStorage {
  async fn get(&self, key: &str) -> Result<Option<CachedRecord>> {
    let hash = key_hash(key);

    let row: Option<(Vec<u8>, i64)> = self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT data, last_updated FROM endpoint_cache WHERE key_hash = ?",
            params![hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()
          .map_err(|e| eyre!("Failed to query cache: {}", e))
      })
      .await?;

    match row {
      Some((data, last_updated)) => {
        let data = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cached record {}: {}", key, e))?;
        let last_updated = DateTime::from_timestamp_millis(last_updated)
          .ok_or_else(|| eyre!("Invalid timestamp {} for {}", last_updated, key))?;
        Ok(Some(CachedRecord { data, last_updated }))
      }
      None => Ok(None),
    }
  }

  async fn set(&self, key: &str, record: &CachedRecord) -> Result<()> {
    let hash = key_hash(key);
    let cache_key = key.to_string();
    let data = serde_json::to_vec(&record.data)
      .map_err(|e| eyre!("Failed to serialize cached record {}: {}", key, e))?;
    let last_updated = record.last_updated.timestamp_millis();

    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO endpoint_cache (key_hash, cache_key, data, last_updated, cached_at)
             VALUES (?, ?, ?, ?, datetime('now'))",
            params![hash, cache_key, data, last_updated],
          )
          .map_err(|e| eyre!("Failed to store cached record: {}", e))?;
        Ok(())
      })
      .await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let hash = key_hash(key);

    self
      .with_conn(move |conn| {
        conn
          .execute("DELETE FROM endpoint_cache WHERE key_hash = ?", params![hash])
          .map_err(|e| eyre!("Failed to delete cached record: {}", e))?;
        Ok(())
      })
      .await
  }

  async fn clear_all(&self) -> Result<()> {
    self
      .with_conn(|conn| {
        conn
          .execute("DELETE FROM endpoint_cache", [])
          .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
        Ok(())
      })
      .await
  }

  fn name(&self) -> &'static str {
    "bulk"
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use serde_json::json;

  fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open_at(&dir.path().join("bulk.db")).unwrap();
    (dir, storage)
  }

  #[tokio::test]
  async fn test_set_then_get() {
    let (_dir, storage) = open_temp();
    let record = CachedRecord::new(
      json!({"rows": [{"id": 1, "name": "Ada"}, {"id": 2, "name": "Grace"}]}),
      Utc::now(),
    );

    storage.set("ns:users", &record).await.unwrap();

    assert_eq!(storage.get("ns:users").await.unwrap(), Some(record));
  }

  #[tokio::test]
  async fn test_overwrite_and_remove() {
    let (_dir, storage) = open_temp();
    let first = CachedRecord::new(json!(1), Utc::now());
    let second = CachedRecord::new(json!(2), Utc::now());

    storage.set("ns:n", &first).await.unwrap();
    storage.set("ns:n", &second).await.unwrap();
    assert_eq!(storage.get("ns:n").await.unwrap(), Some(second));

    storage.remove("ns:n").await.unwrap();
    storage.remove("ns:n").await.unwrap();
    assert_eq!(storage.get("ns:n").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_keys_do_not_interfere() {
    let (_dir, storage) = open_temp();
    let a = CachedRecord::new(json!("a"), Utc::now());
    let b = CachedRecord::new(json!("b"), Utc::now());

    let (ra, rb) = tokio::join!(storage.set("ns:a", &a), storage.set("ns:b", &b));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(storage.get("ns:a").await.unwrap(), Some(a));
    assert_eq!(storage.get("ns:b").await.unwrap(), Some(b));

    storage.clear_all().await.unwrap();
    assert_eq!(storage.get("ns:a").await.unwrap(), None);
  }
}
