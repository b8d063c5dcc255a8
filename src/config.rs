use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_LOCAL_QUOTA_BYTES;
use crate::query::{EngineOptions, Freshness};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Prefix for every persisted key
  pub namespace: String,
  /// Freshness for endpoints that don't set their own (milliseconds or "never")
  #[serde(deserialize_with = "deserialize_freshness")]
  pub default_freshness: Freshness,
  pub cache: CacheConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      namespace: "querycache".to_string(),
      default_freshness: Freshness::default(),
      cache: CacheConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, nothing is persisted and every lookup misses
  pub enabled: bool,
  /// Directory for the persistent backends (defaults to the user data dir)
  pub dir: Option<PathBuf>,
  /// Size limit for the local key-value file
  pub local_quota_bytes: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      dir: None,
      local_quota_bytes: DEFAULT_LOCAL_QUOTA_BYTES,
    }
  }
}

impl CacheConfig {
  pub fn resolve_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("querycache"))
  }
}

fn deserialize_freshness<'de, D>(deserializer: D) -> Result<Freshness, D::Error>
where
  D: serde::Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Millis(u64),
    Text(String),
  }

  match Raw::deserialize(deserializer)? {
    Raw::Millis(ms) => Freshness::try_from_millis(ms).map_err(serde::de::Error::custom),
    Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./querycache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querycache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("querycache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querycache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn engine_options(&self) -> EngineOptions {
    EngineOptions {
      namespace: self.namespace.clone(),
      default_freshness: self.default_freshness,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.namespace, "querycache");
    assert_eq!(config.default_freshness, Freshness::default());
    assert!(config.cache.enabled);
    assert_eq!(config.cache.local_quota_bytes, DEFAULT_LOCAL_QUOTA_BYTES);
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
namespace: myapp
default_freshness: 30000
cache:
  enabled: false
  dir: /tmp/myapp-cache
  local_quota_bytes: 1024
"#,
    )
    .unwrap();

    assert_eq!(config.namespace, "myapp");
    assert_eq!(config.default_freshness, Freshness::millis(30_000));
    assert!(!config.cache.enabled);
    assert_eq!(config.cache.resolve_dir().unwrap(), PathBuf::from("/tmp/myapp-cache"));
    assert_eq!(config.cache.local_quota_bytes, 1024);
  }

  #[test]
  fn test_never_freshness() {
    let config = Config::parse("default_freshness: never").unwrap();
    assert_eq!(config.default_freshness, Freshness::Never);
    assert_eq!(config.engine_options().default_freshness, Freshness::Never);
  }

  #[test]
  fn test_freshness_beyond_u32_millis() {
    let config = Config::parse("default_freshness: 5000000000").unwrap();
    assert_eq!(config.default_freshness, Freshness::millis(5_000_000_000));
  }

  #[test]
  fn test_bad_freshness_is_rejected() {
    assert!(Config::parse("default_freshness: later").is_err());
    assert!(Config::parse("default_freshness: 18446744073709551615").is_err());
  }

  #[test]
  fn test_explicit_missing_path_errors() {
    let err = Config::load(Some(Path::new("/nonexistent/querycache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
