//! Volatile in-process backend.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::traits::{CacheBackend, CachedRecord};

/// Backend that keeps records in a map for the lifetime of the process.
#[derive(Default)]
pub struct MemoryBackend {
  records: Mutex<HashMap<String, CachedRecord>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
  async fn get(&self, key: &str) -> Result<Option<CachedRecord>> {
    let records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(records.get(key).cloned())
  }

  async fn set(&self, key: &str, record: &CachedRecord) -> Result<()> {
    let mut records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    records.insert(key.to_string(), record.clone());
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let mut records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    records.remove(key);
    Ok(())
  }

  async fn clear_all(&self) -> Result<()> {
    let mut records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    records.clear();
    Ok(())
  }

  fn name(&self) -> &'static str {
    "memory"
  }
}
