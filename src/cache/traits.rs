//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Persisted form of an endpoint's data.
///
/// Serialized as `{ "data": <payload>, "lastUpdated": <epoch millis> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRecord {
  /// The fetched payload
  pub data: Value,
  /// When the payload was fetched
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub last_updated: DateTime<Utc>,
}

impl CachedRecord {
  /// Create a record, truncating the timestamp to the persisted precision.
  ///
  /// Persistent backends store milliseconds, so a record built here reads back
  /// equal to itself from every backend.
  pub fn new(data: Value, last_updated: DateTime<Utc>) -> Self {
    let last_updated =
      DateTime::from_timestamp_millis(last_updated.timestamp_millis()).unwrap_or(last_updated);
    Self { data, last_updated }
  }
}

/// Uniform interface over a storage medium.
///
/// Backends may be shared by many endpoints; keys are already namespaced by
/// the engine, so implementations only need to keep distinct keys apart.
#[async_trait]
pub trait CacheBackend: Send + Sync {
  /// Look up a record. A missing key is `Ok(None)`.
  async fn get(&self, key: &str) -> Result<Option<CachedRecord>>;

  /// Store or overwrite a record.
  async fn set(&self, key: &str, record: &CachedRecord) -> Result<()>;

  /// Remove a record. Removing a missing key is not an error.
  async fn remove(&self, key: &str) -> Result<()>;

  /// Remove every record held by this backend.
  async fn clear_all(&self) -> Result<()>;

  /// Short name used in log output.
  fn name(&self) -> &'static str;
}

/// Selects which backend an endpoint persists to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  /// Volatile in-process map, lost on restart
  #[default]
  Memory,
  /// Small persistent key-value file with a size quota (preferences, tokens)
  Local,
  /// Large persistent SQLite store (bulk data)
  Bulk,
}

impl BackendKind {
  pub const ALL: [BackendKind; 3] = [BackendKind::Memory, BackendKind::Local, BackendKind::Bulk];

  pub fn as_str(&self) -> &'static str {
    match self {
      BackendKind::Memory => "memory",
      BackendKind::Local => "local",
      BackendKind::Bulk => "bulk",
    }
  }
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for BackendKind {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "memory" | "volatile" => Ok(BackendKind::Memory),
      "local" => Ok(BackendKind::Local),
      "bulk" | "sqlite" => Ok(BackendKind::Bulk),
      other => Err(format!(
        "unknown backend '{}' (expected memory, local or bulk)",
        other
      )),
    }
  }
}

/// Derive the storage key for an endpoint.
pub fn namespaced_key(namespace: &str, key: &str) -> String {
  format!("{}:{}", namespace, key)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_record_serializes_epoch_millis() {
    let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
    let record = CachedRecord::new(json!({"id": 1}), at);

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value, json!({"data": {"id": 1}, "lastUpdated": 1_700_000_000_123i64}));
  }

  #[test]
  fn test_record_truncates_to_millis() {
    let at = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
    let record = CachedRecord::new(Value::Null, at);

    assert_eq!(record.last_updated.timestamp_millis(), 1_700_000_000_123);
    assert_eq!(record.last_updated.timestamp_subsec_nanos(), 123_000_000);
  }

  #[test]
  fn test_backend_kind_parse() {
    assert_eq!("bulk".parse::<BackendKind>(), Ok(BackendKind::Bulk));
    assert_eq!(" Local ".parse::<BackendKind>(), Ok(BackendKind::Local));
    assert_eq!("volatile".parse::<BackendKind>(), Ok(BackendKind::Memory));
    assert!("redis".parse::<BackendKind>().is_err());
  }

  #[test]
  fn test_namespaced_key() {
    assert_eq!(namespaced_key("querycache", "users"), "querycache:users");
  }
}
