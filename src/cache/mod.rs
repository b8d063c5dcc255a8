//! Pluggable storage for fetched endpoint data.
//!
//! Three backends sit behind the one [`CacheBackend`] contract:
//! - `memory`: volatile map, cleared on restart
//! - `local`: small persistent JSON file with a byte quota
//! - `bulk`: large persistent SQLite store
//!
//! A no-op backend replaces all three when caching is disabled.

mod local;
mod memory;
mod noop;
mod storage;
mod traits;

pub use local::{LocalBackend, DEFAULT_LOCAL_QUOTA_BYTES};
pub use memory::MemoryBackend;
pub use noop::NoopBackend;
pub use storage::SqliteStorage;
pub use traits::{namespaced_key, BackendKind, CacheBackend, CachedRecord};

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use crate::config::CacheConfig;

/// One backend instance per [`BackendKind`], shared by all endpoints.
#[derive(Clone)]
pub struct Backends {
  memory: Arc<dyn CacheBackend>,
  local: Arc<dyn CacheBackend>,
  bulk: Arc<dyn CacheBackend>,
}

impl Backends {
  pub fn new(
    memory: Arc<dyn CacheBackend>,
    local: Arc<dyn CacheBackend>,
    bulk: Arc<dyn CacheBackend>,
  ) -> Self {
    Self {
      memory,
      local,
      bulk,
    }
  }

  /// Separate in-memory maps for every kind. Useful for tests and hosts
  /// without a writable disk.
  pub fn in_memory() -> Self {
    Self::new(
      Arc::new(MemoryBackend::new()),
      Arc::new(MemoryBackend::new()),
      Arc::new(MemoryBackend::new()),
    )
  }

  /// Every kind discards writes and always misses.
  pub fn disabled() -> Self {
    let noop: Arc<dyn CacheBackend> = Arc::new(NoopBackend);
    Self::new(Arc::clone(&noop), Arc::clone(&noop), noop)
  }

  /// Open the persistent backends under the configured cache directory.
  pub fn from_config(config: &CacheConfig) -> Result<Self> {
    if !config.enabled {
      return Ok(Self::disabled());
    }

    let dir = config.resolve_dir()?;
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create cache directory {}: {}", dir.display(), e))?;

    let local = LocalBackend::open(dir.join("local.json"), config.local_quota_bytes)?;
    let bulk = SqliteStorage::open_at(&dir.join("bulk.db"))?;

    Ok(Self::new(
      Arc::new(MemoryBackend::new()),
      Arc::new(local),
      Arc::new(bulk),
    ))
  }

  pub fn select(&self, kind: BackendKind) -> &Arc<dyn CacheBackend> {
    match kind {
      BackendKind::Memory => &self.memory,
      BackendKind::Local => &self.local,
      BackendKind::Bulk => &self.bulk,
    }
  }
}

impl Default for Backends {
  fn default() -> Self {
    Self::in_memory()
  }
}
