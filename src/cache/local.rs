//! Small persistent key-value backend.
//!
//! All records live in a single JSON file that is rewritten on every change,
//! with an in-memory mirror serving reads. A byte quota bounds the file size;
//! a write that would exceed it is rejected and leaves the store untouched.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;

use super::traits::{CacheBackend, CachedRecord};

/// Default quota, comparable to a browser's local storage.
pub const DEFAULT_LOCAL_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// File-backed store for small records such as preferences or tokens.
pub struct LocalBackend {
  path: PathBuf,
  quota_bytes: u64,
  records: Mutex<BTreeMap<String, CachedRecord>>,
}

impl LocalBackend {
  /// Open the store at `path`, loading any existing records.
  ///
  /// A missing file starts an empty store. An unreadable or corrupt file is
  /// logged and also starts empty, since the cache can always be refetched.
  pub fn open(path: impl Into<PathBuf>, quota_bytes: u64) -> Result<Self> {
    let path = path.into();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let records = match std::fs::read(&path) {
      Ok(bytes) => match serde_json::from_slice(&bytes) {
        Ok(records) => records,
        Err(e) => {
          warn!(path = %path.display(), error = %e, "Discarding corrupt local cache file");
          BTreeMap::new()
        }
      },
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Failed to read local cache file");
        BTreeMap::new()
      }
    };

    Ok(Self {
      path,
      quota_bytes,
      records: Mutex::new(records),
    })
  }

  /// Serialize and write the given records, enforcing the quota.
  async fn persist(&self, records: &BTreeMap<String, CachedRecord>) -> Result<()> {
    let bytes =
      serde_json::to_vec(records).map_err(|e| eyre!("Failed to serialize local cache: {}", e))?;

    if bytes.len() as u64 > self.quota_bytes {
      return Err(eyre!(
        "Local cache quota exceeded: {} bytes needed, {} allowed",
        bytes.len(),
        self.quota_bytes
      ));
    }

    // Write to a sibling file first so a crash never leaves a torn file behind
    let tmp = self.path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes)
      .await
      .map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
    tokio::fs::rename(&tmp, &self.path)
      .await
      .map_err(|e| eyre!("Failed to replace {}: {}", self.path.display(), e))?;

    Ok(())
  }
}

#[async_trait]
impl CacheBackend for LocalBackend {
  async fn get(&self, key: &str) -> Result<Option<CachedRecord>> {
    let records = self.records.lock().await;
    Ok(records.get(key).cloned())
  }

  async fn set(&self, key: &str, record: &CachedRecord) -> Result<()> {
    let mut records = self.records.lock().await;

    let mut updated = records.clone();
    updated.insert(key.to_string(), record.clone());
    self.persist(&updated).await?;

    *records = updated;
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let mut records = self.records.lock().await;
    if !records.contains_key(key) {
      return Ok(());
    }

    let mut updated = records.clone();
    updated.remove(key);
    self.persist(&updated).await?;

    *records = updated;
    Ok(())
  }

  async fn clear_all(&self) -> Result<()> {
    let mut records = self.records.lock().await;
    self.persist(&BTreeMap::new()).await?;
    records.clear();
    Ok(())
  }

  fn name(&self) -> &'static str {
    "local"
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use serde_json::json;

  #[tokio::test]
  async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.json");
    let record = CachedRecord::new(json!({"theme": "dark"}), Utc::now());

    {
      let backend = LocalBackend::open(&path, DEFAULT_LOCAL_QUOTA_BYTES).unwrap();
      backend.set("ns:prefs", &record).await.unwrap();
    }

    let reopened = LocalBackend::open(&path, DEFAULT_LOCAL_QUOTA_BYTES).unwrap();
    assert_eq!(reopened.get("ns:prefs").await.unwrap(), Some(record));
  }

  #[tokio::test]
  async fn test_quota_exceeded_rejects_write() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::open(dir.path().join("local.json"), 64).unwrap();

    let small = CachedRecord::new(json!(1), Utc::now());
    backend.set("ns:a", &small).await.unwrap();

    let big = CachedRecord::new(json!("x".repeat(256)), Utc::now());
    let err = backend.set("ns:b", &big).await.unwrap_err();
    assert!(err.to_string().contains("quota exceeded"));

    // Earlier record is untouched, rejected one never landed
    assert_eq!(backend.get("ns:a").await.unwrap(), Some(small));
    assert_eq!(backend.get("ns:b").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_corrupt_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.json");
    std::fs::write(&path, b"not json").unwrap();

    let backend = LocalBackend::open(&path, DEFAULT_LOCAL_QUOTA_BYTES).unwrap();
    assert_eq!(backend.get("ns:a").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_remove_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.json");
    let backend = LocalBackend::open(&path, DEFAULT_LOCAL_QUOTA_BYTES).unwrap();
    let record = CachedRecord::new(json!(true), Utc::now());

    backend.set("ns:a", &record).await.unwrap();
    backend.set("ns:b", &record).await.unwrap();
    backend.remove("ns:a").await.unwrap();
    backend.remove("ns:missing").await.unwrap();
    assert_eq!(backend.get("ns:a").await.unwrap(), None);

    backend.clear_all().await.unwrap();
    let reopened = LocalBackend::open(&path, DEFAULT_LOCAL_QUOTA_BYTES).unwrap();
    assert_eq!(reopened.get("ns:b").await.unwrap(), None);
  }
}
