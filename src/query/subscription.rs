//! Listener registration and change notification.
//!
//! The keys holding at least one listener form the observed set, which scopes
//! background refresh on environment signals. Removing a key's last listener
//! takes it out of the observed set.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};

use super::state::EndpointState;

pub(crate) type Listener = Arc<dyn Fn(&EndpointState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
  next_id: u64,
  by_key: HashMap<String, Vec<(u64, Listener)>>,
}

pub(crate) struct SubscriptionHub {
  listeners: Mutex<Listeners>,
}

impl SubscriptionHub {
  pub fn new() -> Self {
    Self {
      listeners: Mutex::new(Listeners::default()),
    }
  }

  /// Register a listener for `key`, returning its id.
  pub fn add(&self, key: &str, listener: Listener) -> u64 {
    let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    let id = listeners.next_id;
    listeners.next_id += 1;
    listeners
      .by_key
      .entry(key.to_string())
      .or_default()
      .push((id, listener));
    id
  }

  /// Remove a listener. Returns false if it was already gone.
  pub fn remove(&self, key: &str, id: u64) -> bool {
    let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(entries) = listeners.by_key.get_mut(key) else {
      return false;
    };

    let before = entries.len();
    entries.retain(|(entry_id, _)| *entry_id != id);
    let removed = entries.len() != before;

    if entries.is_empty() {
      listeners.by_key.remove(key);
      debug!(endpoint = %key, "Endpoint no longer observed");
    }

    removed
  }

  /// Deliver `state` to every listener of `key`.
  pub fn notify(&self, key: &str, state: &EndpointState) {
    // Snapshot the listeners so callbacks can subscribe or unsubscribe freely
    let targets: Vec<Listener> = {
      let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
      match listeners.by_key.get(key) {
        Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
        None => return,
      }
    };

    for listener in targets {
      deliver(key, &listener, state);
    }
  }

  /// Keys with at least one listener.
  pub fn observed(&self) -> Vec<String> {
    let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    let mut keys: Vec<String> = listeners.by_key.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn is_observed(&self, key: &str) -> bool {
    let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    listeners.by_key.contains_key(key)
  }
}

/// Call one listener. A panicking listener is logged and skipped, so it can
/// never abort the fetch that produced `state`.
pub(crate) fn deliver(key: &str, listener: &Listener, state: &EndpointState) {
  if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
    warn!(endpoint = %key, "Subscriber panicked while handling a state change");
  }
}

/// Handle for an active subscription.
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "the listener stays registered until `unsubscribe` is called"]
pub struct Subscription {
  key: String,
  id: u64,
  hub: Weak<SubscriptionHub>,
}

impl Subscription {
  pub(crate) fn new(key: String, id: u64, hub: &Arc<SubscriptionHub>) -> Self {
    Self {
      key,
      id,
      hub: Arc::downgrade(hub),
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Remove the listener. A no-op if the engine is already gone.
  pub fn unsubscribe(self) {
    if let Some(hub) = self.hub.upgrade() {
      hub.remove(&self.key, self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
    let counter = Arc::clone(counter);
    Arc::new(move |_: &EndpointState| {
      counter.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn test_notify_reaches_only_that_key() {
    let hub = SubscriptionHub::new();
    let users = Arc::new(AtomicUsize::new(0));
    let posts = Arc::new(AtomicUsize::new(0));
    hub.add("users", counting_listener(&users));
    hub.add("posts", counting_listener(&posts));

    hub.notify("users", &EndpointState::default());

    assert_eq!(users.load(Ordering::SeqCst), 1);
    assert_eq!(posts.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_last_listener_leaves_observed_set() {
    let hub = SubscriptionHub::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let first = hub.add("users", counting_listener(&counter));
    let second = hub.add("users", counting_listener(&counter));
    assert_eq!(hub.observed(), vec!["users".to_string()]);

    assert!(hub.remove("users", first));
    assert!(hub.is_observed("users"));

    assert!(hub.remove("users", second));
    assert!(!hub.is_observed("users"));
    assert!(hub.observed().is_empty());

    assert!(!hub.remove("users", second));
  }

  #[test]
  fn test_panicking_listener_does_not_stop_others() {
    let hub = SubscriptionHub::new();
    let counter = Arc::new(AtomicUsize::new(0));
    hub.add("users", Arc::new(|_: &EndpointState| panic!("listener bug")));
    hub.add("users", counting_listener(&counter));

    hub.notify("users", &EndpointState::default());
    hub.notify("users", &EndpointState::default());

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(hub.is_observed("users"));
  }

  #[test]
  fn test_listener_may_unsubscribe_itself() {
    let hub = Arc::new(SubscriptionHub::new());
    let weak = Arc::downgrade(&hub);
    let id = Arc::new(Mutex::new(None::<u64>));
    let id_in_listener = Arc::clone(&id);

    let listener: Listener = Arc::new(move |_: &EndpointState| {
      if let (Some(hub), Some(id)) = (weak.upgrade(), *id_in_listener.lock().unwrap()) {
        hub.remove("users", id);
      }
    });
    *id.lock().unwrap() = Some(hub.add("users", listener));

    hub.notify("users", &EndpointState::default());
    assert!(!hub.is_observed("users"));
  }
}
