use async_trait::async_trait;
use color_eyre::Result;

use super::traits::{CacheBackend, CachedRecord};

/// Backend that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopBackend;

#[async_trait]
impl CacheBackend for NoopBackend {
  async fn get(&self, _key: &str) -> Result<Option<CachedRecord>> {
    Ok(None) // Always miss
  }

  async fn set(&self, _key: &str, _record: &CachedRecord) -> Result<()> {
    Ok(()) // Discard
  }

  async fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  async fn clear_all(&self) -> Result<()> {
    Ok(())
  }

  fn name(&self) -> &'static str {
    "noop"
  }
}
