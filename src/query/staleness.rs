//! Freshness windows and the staleness check.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

/// How long fetched data stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Data older than this is stale
  Window(Duration),
  /// Data never goes stale once fetched
  Never,
}

impl Freshness {
  pub fn millis(ms: i64) -> Self {
    Freshness::Window(Duration::milliseconds(ms))
  }

  /// A window of `ms` milliseconds, rejecting values a duration can't hold.
  pub fn try_from_millis(ms: u64) -> Result<Self, String> {
    i64::try_from(ms)
      .map(Freshness::millis)
      .map_err(|_| format!("freshness of {}ms is too large", ms))
  }
}

impl Default for Freshness {
  fn default() -> Self {
    Freshness::Window(Duration::minutes(1))
  }
}

impl fmt::Display for Freshness {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Freshness::Window(window) => write!(f, "{}ms", window.num_milliseconds()),
      Freshness::Never => f.write_str("never"),
    }
  }
}

/// Parses either a number of milliseconds or `never`.
impl FromStr for Freshness {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("never") {
      return Ok(Freshness::Never);
    }

    let ms = s.strip_suffix("ms").unwrap_or(s);
    let ms = ms
      .parse::<u64>()
      .map_err(|_| format!("invalid freshness '{}' (expected milliseconds or 'never')", s))?;
    Freshness::try_from_millis(ms)
  }
}

/// Whether data last fetched at `last_updated` needs refetching at `now`.
///
/// Never-fetched data is always stale, whatever the window.
pub fn is_stale(last_updated: Option<DateTime<Utc>>, freshness: Freshness, now: DateTime<Utc>) -> bool {
  match (last_updated, freshness) {
    (None, _) => true,
    (Some(_), Freshness::Never) => false,
    (Some(at), Freshness::Window(window)) => now - at > window,
  }
}
