//! Per-endpoint reactive state and the store that owns it.

use chrono::{DateTime, Utc};
use color_eyre::eyre::{eyre, Report};
use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use super::subscription::SubscriptionHub;
use crate::cache::CachedRecord;

/// An error returned by an endpoint's fetcher, kept verbatim.
///
/// Cloning shares the same report; two errors are equal only if they come
/// from the same failed fetch.
#[derive(Clone)]
pub struct FetchError(Arc<Report>);

impl FetchError {
  pub fn report(&self) -> &Report {
    &self.0
  }
}

impl From<Report> for FetchError {
  fn from(report: Report) -> Self {
    Self(Arc::new(report))
  }
}

impl PartialEq for FetchError {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

impl fmt::Display for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&*self.0, f)
  }
}

impl fmt::Debug for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.0, f)
  }
}

impl std::error::Error for FetchError {}

/// Where an endpoint sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
  /// Nothing fetched or hydrated yet
  Uninitialized,
  /// Holding data (possibly none after a cache miss), not fetching
  Idle,
  /// A fetch is running
  Loading,
  /// The last fetch failed
  Errored,
}

/// Snapshot of one endpoint's data and fetch status.
///
/// Values are immutable; every transition builds a new snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointState {
  data: Option<Value>,
  is_loading: bool,
  error: Option<FetchError>,
  last_updated: Option<DateTime<Utc>>,
}

impl EndpointState {
  pub fn data(&self) -> Option<&Value> {
    self.data.as_ref()
  }

  /// Deserialize the data into a concrete type.
  pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
    self
      .data
      .as_ref()
      .map(|data| {
        serde_json::from_value(data.clone())
          .map_err(|e| eyre!("Failed to deserialize endpoint data: {}", e))
      })
      .transpose()
  }

  pub fn is_loading(&self) -> bool {
    self.is_loading
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }

  pub fn error(&self) -> Option<&FetchError> {
    self.error.as_ref()
  }

  /// When data was last fetched successfully.
  pub fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.last_updated
  }

  pub fn status(&self) -> EndpointStatus {
    if self.is_loading {
      EndpointStatus::Loading
    } else if self.error.is_some() {
      EndpointStatus::Errored
    } else if self.data.is_none() && self.last_updated.is_none() {
      EndpointStatus::Uninitialized
    } else {
      EndpointStatus::Idle
    }
  }

  /// A fetch started: loading, error cleared, data kept.
  pub(crate) fn loading(&self) -> Self {
    Self {
      data: self.data.clone(),
      is_loading: true,
      error: None,
      last_updated: self.last_updated,
    }
  }

  /// A fetch finished with fresh data.
  pub(crate) fn succeeded(&self, record: &CachedRecord) -> Self {
    Self {
      data: Some(record.data.clone()),
      is_loading: false,
      error: None,
      last_updated: Some(record.last_updated),
    }
  }

  /// A fetch failed. Previously fetched data stays visible next to the error.
  pub(crate) fn failed(&self, error: FetchError) -> Self {
    Self {
      data: self.data.clone(),
      is_loading: false,
      error: Some(error),
      last_updated: self.last_updated,
    }
  }

  /// Load a persisted record unless the current state is already newer.
  pub(crate) fn hydrated(&self, record: &CachedRecord) -> Self {
    match self.last_updated {
      Some(current) if current >= record.last_updated => self.clone(),
      _ => Self {
        data: Some(record.data.clone()),
        last_updated: Some(record.last_updated),
        ..self.clone()
      },
    }
  }

  /// A fetch was abandoned before it settled.
  pub(crate) fn settled(&self) -> Self {
    Self {
      is_loading: false,
      ..self.clone()
    }
  }
}

/// Canonical state per endpoint key.
///
/// Every write that changes a key's state notifies that key's subscribers
/// exactly once; writes that leave the state equal are dropped silently.
pub(crate) struct StateStore {
  states: Mutex<HashMap<String, EndpointState>>,
  hub: Arc<SubscriptionHub>,
}

impl StateStore {
  pub fn new(hub: Arc<SubscriptionHub>) -> Self {
    Self {
      states: Mutex::new(HashMap::new()),
      hub,
    }
  }

  /// Current snapshot, or the empty state for unknown keys.
  pub fn get(&self, key: &str) -> EndpointState {
    self
      .states
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
      .unwrap_or_default()
  }

  /// Replace the state for `key` with `transition(current)`.
  ///
  /// Returns whether the state changed.
  pub fn set<F>(&self, key: &str, transition: F) -> bool
  where
    F: FnOnce(&EndpointState) -> EndpointState,
  {
    match self.update(key, transition) {
      Some(next) => {
        // Listeners may call back into the engine, so notify outside the lock
        self.publish(key, &next);
        true
      }
      None => false,
    }
  }

  /// Like [`StateStore::set`] but without notifying. Returns the new state
  /// if it changed; the caller must [`StateStore::publish`] it.
  pub fn update<F>(&self, key: &str, transition: F) -> Option<EndpointState>
  where
    F: FnOnce(&EndpointState) -> EndpointState,
  {
    let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
    let current = states.get(key).cloned().unwrap_or_default();
    let next = transition(&current);
    if next == current {
      return None;
    }
    states.insert(key.to_string(), next.clone());
    Some(next)
  }

  pub fn publish(&self, key: &str, state: &EndpointState) {
    self.hub.notify(key, state);
  }

  /// Reset every known key to the empty state.
  pub fn reset_all(&self) {
    let keys: Vec<String> = self
      .states
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect();

    for key in keys {
      self.set(&key, |_| EndpointState::default());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn record(data: Value, ms: i64) -> CachedRecord {
    CachedRecord::new(data, DateTime::from_timestamp_millis(ms).unwrap())
  }

  #[test]
  fn test_default_state() {
    let state = EndpointState::default();
    assert_eq!(state.data(), None);
    assert!(!state.is_loading());
    assert!(!state.is_error());
    assert!(state.error().is_none());
    assert_eq!(state.last_updated(), None);
    assert_eq!(state.status(), EndpointStatus::Uninitialized);
  }

  #[test]
  fn test_transitions() {
    let idle = EndpointState::default().succeeded(&record(json!([1]), 10));
    assert_eq!(idle.status(), EndpointStatus::Idle);

    let loading = idle.loading();
    assert_eq!(loading.status(), EndpointStatus::Loading);
    assert_eq!(loading.data(), Some(&json!([1])));

    let errored = loading.failed(FetchError::from(eyre!("network")));
    assert_eq!(errored.status(), EndpointStatus::Errored);
    assert!(errored.is_error());
    assert_eq!(errored.error().unwrap().to_string(), "network");
    // Stale data survives the failure, and the timestamp is not bumped
    assert_eq!(errored.data(), Some(&json!([1])));
    assert_eq!(errored.last_updated(), idle.last_updated());

    let retry = errored.loading();
    assert!(!retry.is_error());
    assert!(retry.error().is_none());
  }

  #[test]
  fn test_hydrated_keeps_newer_state() {
    let newer = EndpointState::default().succeeded(&record(json!("new"), 200));
    assert_eq!(newer.hydrated(&record(json!("old"), 100)), newer);

    let hydrated = EndpointState::default().hydrated(&record(json!("old"), 100));
    assert_eq!(hydrated.data(), Some(&json!("old")));
    assert!(!hydrated.is_loading());
  }

  #[test]
  fn test_data_as() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
      name: String,
    }

    let state = EndpointState::default().succeeded(&record(json!([{"name": "Ada"}]), 1));
    let users: Vec<User> = state.data_as().unwrap().unwrap();
    assert_eq!(users, vec![User { name: "Ada".into() }]);

    assert!(state.data_as::<u32>().is_err());
    assert_eq!(EndpointState::default().data_as::<u32>().unwrap(), None);
  }

  #[test]
  fn test_set_notifies_only_on_change() {
    let hub = Arc::new(SubscriptionHub::new());
    let store = StateStore::new(Arc::clone(&hub));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    hub.add(
      "users",
      Arc::new(move |_: &EndpointState| {
        counter.fetch_add(1, Ordering::SeqCst);
      }),
    );

    assert!(store.set("users", |s| s.loading()));
    assert!(!store.set("users", |s| s.loading()));
    assert!(store.set("users", |s| s.succeeded(&record(json!(1), 5))));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.get("users").data(), Some(&json!(1)));
  }

  #[test]
  fn test_update_defers_notification() {
    let hub = Arc::new(SubscriptionHub::new());
    let store = StateStore::new(Arc::clone(&hub));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    hub.add(
      "users",
      Arc::new(move |_: &EndpointState| {
        counter.fetch_add(1, Ordering::SeqCst);
      }),
    );

    let loading = store.update("users", |s| s.loading()).unwrap();
    assert!(store.get("users").is_loading());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.update("users", |s| s.loading()), None);

    store.publish("users", &loading);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_reset_all() {
    let store = StateStore::new(Arc::new(SubscriptionHub::new()));
    store.set("a", |s| s.succeeded(&record(json!(1), 5)));
    store.set("b", |s| s.loading());

    store.reset_all();

    assert_eq!(store.get("a"), EndpointState::default());
    assert_eq!(store.get("b"), EndpointState::default());
  }
}
