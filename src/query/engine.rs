//! The engine: endpoint definitions, single-flight refetch and the public API.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::registry::{EndpointDefinition, EndpointOptions, EndpointRegistry, Fetcher};
use super::signals::{Signal, Signals};
use super::staleness::{is_stale, Freshness};
use super::state::{EndpointState, FetchError, StateStore};
use super::subscription::{deliver, Listener, Subscription, SubscriptionHub};
use crate::cache::{namespaced_key, Backends, BackendKind, CachedRecord};
use crate::config::Config;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
  /// Prefix for persisted keys, so engines can share a backend
  pub namespace: String,
  /// Freshness for endpoints defined without one
  pub default_freshness: Freshness,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      namespace: "querycache".to_string(),
      default_freshness: Freshness::default(),
    }
  }
}

/// A fetch currently running for one endpoint.
struct InFlight {
  id: u64,
  done: Shared<BoxFuture<'static, ()>>,
  abort: AbortHandle,
}

struct Inner {
  options: EngineOptions,
  backends: Backends,
  clock: Arc<dyn Clock>,
  registry: EndpointRegistry,
  hub: Arc<SubscriptionHub>,
  store: StateStore,
  in_flight: Mutex<HashMap<String, InFlight>>,
  next_flight: AtomicU64,
  signal_listener: Mutex<Option<JoinHandle<()>>>,
}

/// Fetches, caches and publishes endpoint data.
///
/// Cloning is cheap and clones share everything. Operations that start
/// background work (`subscribe`, `refetch`, `start`) must run inside a tokio
/// runtime.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<Inner>,
}

impl Engine {
  pub fn new(options: EngineOptions, backends: Backends) -> Self {
    Self::with_clock(options, backends, Arc::new(SystemClock))
  }

  pub fn with_clock(options: EngineOptions, backends: Backends, clock: Arc<dyn Clock>) -> Self {
    let hub = Arc::new(SubscriptionHub::new());

    Self {
      inner: Arc::new(Inner {
        options,
        backends,
        clock,
        registry: EndpointRegistry::new(),
        store: StateStore::new(Arc::clone(&hub)),
        hub,
        in_flight: Mutex::new(HashMap::new()),
        next_flight: AtomicU64::new(0),
        signal_listener: Mutex::new(None),
      }),
    }
  }

  /// Build an engine with persistent backends opened from configuration.
  pub fn from_config(config: &Config) -> Result<Self> {
    let backends = Backends::from_config(&config.cache)?;
    Ok(Self::new(config.engine_options(), backends))
  }

  pub fn options(&self) -> &EngineOptions {
    &self.inner.options
  }

  /// Register or replace an endpoint and warm-load its cached record.
  ///
  /// Never fetches. Redefining a key keeps its current state; a fetch still
  /// running under the old fetcher is abandoned so the next refetch uses the
  /// new one.
  pub async fn define_endpoint<T, F, Fut>(&self, key: &str, fetcher: F, options: EndpointOptions)
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let fetcher: Fetcher = Arc::new(move || {
      let fut = fetcher();
      async move {
        let data = fut.await?;
        serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize endpoint data: {}", e))
      }
      .boxed()
    });

    let definition = EndpointDefinition {
      fetcher,
      freshness: options.freshness.unwrap_or(self.inner.options.default_freshness),
      backend: options.backend,
    };

    if self.inner.registry.define(key, definition).is_some() {
      debug!(endpoint = %key, "Redefined endpoint");
      self.abandon_in_flight(key);
    } else {
      debug!(endpoint = %key, backend = %options.backend, "Defined endpoint");
    }

    self.inner.warm_load(key, options.backend).await;
  }

  /// Listen for state changes on `key`.
  ///
  /// The callback runs once immediately with the current snapshot, then on
  /// every change. If the endpoint is stale a fetch starts right away and
  /// the callback hears its loading state before `subscribe` returns.
  pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
  where
    F: Fn(&EndpointState) + Send + Sync + 'static,
  {
    let listener: Listener = Arc::new(callback);
    let id = self.inner.hub.add(key, Arc::clone(&listener));
    deliver(key, &listener, &self.inner.store.get(key));

    // The fetch task runs on its own; nobody needs to wait for it here
    let _ = self.begin_fetch(key, false);

    Subscription::new(key.to_string(), id, &self.inner.hub)
  }

  /// Fetch `key` if stale, or unconditionally when `force` is set.
  ///
  /// Concurrent callers share one fetch. Resolves once that fetch settles;
  /// fetch failures are recorded in the endpoint state, not returned.
  pub async fn refetch(&self, key: &str, force: bool) {
    self.ensure_fresh(key, force).await;
  }

  /// Drop the cached record and reset the state, without fetching.
  ///
  /// A fetch in flight is cancelled first so its result cannot land on top
  /// of the reset. Callers waiting on it are released.
  pub async fn invalidate(&self, key: &str) {
    if let Some(done) = self.cancel_in_flight(key) {
      done.await;
      debug!(endpoint = %key, "Cancelled fetch for invalidated endpoint");
    }

    let storage_key = self.inner.storage_key(key);

    let kinds: Vec<BackendKind> = match self.inner.registry.get(key) {
      Some(definition) => vec![definition.backend],
      // Unknown endpoint: a record may linger from an earlier run in any backend
      None => BackendKind::ALL.to_vec(),
    };

    for kind in kinds {
      let backend = self.inner.backends.select(kind);
      if let Err(e) = backend.remove(&storage_key).await {
        warn!(endpoint = %key, backend = backend.name(), error = %e, "Failed to remove cached record");
      }
    }

    self.inner.store.set(key, |_| EndpointState::default());
    debug!(endpoint = %key, "Invalidated endpoint");
  }

  /// Synchronous snapshot. Unknown keys yield the empty state.
  pub fn get_state(&self, key: &str) -> EndpointState {
    self.inner.store.get(key)
  }

  /// Keys with at least one active subscription.
  pub fn observed(&self) -> Vec<String> {
    self.inner.hub.observed()
  }

  pub fn is_observed(&self, key: &str) -> bool {
    self.inner.hub.is_observed(key)
  }

  /// Clear every backend and reset every endpoint state.
  pub async fn clear_cache(&self) {
    for kind in BackendKind::ALL {
      let backend = self.inner.backends.select(kind);
      if let Err(e) = backend.clear_all().await {
        warn!(backend = backend.name(), error = %e, "Failed to clear backend");
      }
    }
    self.inner.store.reset_all();
  }

  /// Refresh stale observed endpoints whenever `signals` fires.
  ///
  /// Calling `start` on an already started engine does nothing.
  pub fn start(&self, signals: &Signals) {
    let mut listener = self.inner.lock_signal_listener();
    if listener.is_some() {
      debug!("Engine already listening for signals");
      return;
    }

    let mut rx = signals.listen();
    let weak = Arc::downgrade(&self.inner);

    *listener = Some(tokio::spawn(async move {
      loop {
        let signal = match rx.recv().await {
          Ok(signal) => signal,
          Err(RecvError::Lagged(skipped)) => {
            debug!(skipped, "Signal listener lagged");
            continue;
          }
          Err(RecvError::Closed) => break,
        };

        let Some(inner) = weak.upgrade() else {
          break;
        };
        Engine { inner }.refresh_observed(signal);
      }
    }));
  }

  /// Stop listening for signals. Safe to call when not started.
  pub fn stop(&self) {
    if let Some(handle) = self.inner.lock_signal_listener().take() {
      handle.abort();
      debug!("Engine stopped listening for signals");
    }
  }

  pub fn is_started(&self) -> bool {
    self.inner.lock_signal_listener().is_some()
  }

  /// Run a staleness-gated check for every observed endpoint.
  fn refresh_observed(&self, signal: Signal) {
    let observed = self.inner.hub.observed();
    debug!(?signal, endpoints = observed.len(), "Refreshing observed endpoints");

    for key in observed {
      let _ = self.begin_fetch(&key, false);
    }
  }

  async fn ensure_fresh(&self, key: &str, force: bool) {
    if let Some(done) = self.begin_fetch(key, force) {
      done.await;
    }
  }

  /// Join the in-flight fetch for `key` or start one if the data is stale
  /// (or `force` is set). Returns `None` when no fetch is needed.
  ///
  /// A new fetch is marked loading before this returns.
  fn begin_fetch(&self, key: &str, force: bool) -> Option<Shared<BoxFuture<'static, ()>>> {
    let Some(definition) = self.inner.registry.get(key) else {
      debug!(endpoint = %key, "Endpoint not defined, nothing to fetch");
      return None;
    };

    if !force {
      let state = self.inner.store.get(key);
      if !is_stale(state.last_updated(), definition.freshness, self.inner.clock.now()) {
        debug!(endpoint = %key, "Cache fresh, skipping fetch");
        return None;
      }
    }

    let (done, start, loading) = {
      let mut in_flight = self.inner.lock_in_flight();
      if let Some(flight) = in_flight.get(key) {
        debug!(endpoint = %key, "Joining in-flight fetch");
        return Some(flight.done.clone());
      }

      let (flight, start) = self.spawn_fetch(key, definition);
      let done = flight.done.clone();
      in_flight.insert(key.to_string(), flight);
      // Written under the lock so the state never disagrees with the slot
      let loading = self.inner.store.update(key, |s| s.loading());
      (done, start, loading)
    };

    if let Some(state) = loading {
      self.inner.store.publish(key, &state);
    }
    // The task holds off until subscribers have seen the loading state
    let _ = start.send(());

    Some(done)
  }

  /// Start a fetch task that waits for `start` before calling the fetcher.
  /// Must be called with the in-flight map locked, so the task cannot clear
  /// its slot before the slot exists.
  fn spawn_fetch(
    &self,
    key: &str,
    definition: EndpointDefinition,
  ) -> (InFlight, oneshot::Sender<()>) {
    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::clone(&self.inner);
    let owned_key = key.to_string();
    let (start, started) = oneshot::channel();

    let handle = tokio::spawn(async move {
      let _slot = FlightSlot {
        inner: &inner,
        key: &owned_key,
        id,
      };
      let _ = started.await;
      inner.run_fetch(&owned_key, id, definition).await;
    });
    let abort = handle.abort_handle();
    let done = async move {
      // Cancelled tasks resolve too; waiters simply resume
      let _ = handle.await;
    }
    .boxed()
    .shared();

    (InFlight { id, done, abort }, start)
  }

  /// Abort the fetch running for `key`, if any, and free its slot.
  ///
  /// Returns a future that resolves once the task is gone.
  fn cancel_in_flight(&self, key: &str) -> Option<Shared<BoxFuture<'static, ()>>> {
    let flight = self.inner.lock_in_flight().remove(key)?;
    flight.abort.abort();
    Some(flight.done)
  }

  fn abandon_in_flight(&self, key: &str) {
    if self.cancel_in_flight(key).is_some() {
      self.inner.store.set(key, |s| s.settled());
      debug!(endpoint = %key, "Abandoned fetch from previous definition");
    }
  }
}

/// Frees a fetch's in-flight slot however its task ends: normally, by
/// panicking, or by being aborted. Only the slot's own flight is touched.
struct FlightSlot<'a> {
  inner: &'a Inner,
  key: &'a str,
  id: u64,
}

impl Drop for FlightSlot<'_> {
  fn drop(&mut self) {
    let released = {
      let mut in_flight = self.inner.lock_in_flight();
      let ours = in_flight.get(self.key).is_some_and(|f| f.id == self.id);
      if ours {
        in_flight.remove(self.key);
      }
      ours
    };

    // A fetch that never reached a result must not leave the key loading
    if released && self.inner.store.set(self.key, |s| s.settled()) {
      warn!(endpoint = %self.key, "Fetch ended without a result");
    }
  }
}

impl Inner {
  fn storage_key(&self, key: &str) -> String {
    namespaced_key(&self.options.namespace, key)
  }

  fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_signal_listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    self
      .signal_listener
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  async fn warm_load(&self, key: &str, kind: BackendKind) {
    let backend = self.backends.select(kind);

    match backend.get(&self.storage_key(key)).await {
      Ok(Some(record)) => {
        if self.store.set(key, |s| s.hydrated(&record)) {
          debug!(endpoint = %key, backend = backend.name(), "Hydrated from cache");
        }
      }
      Ok(None) => debug!(endpoint = %key, backend = backend.name(), "No cached record"),
      Err(e) => {
        warn!(endpoint = %key, backend = backend.name(), error = %e, "Failed to read cached record")
      }
    }
  }

  fn is_current_flight(&self, key: &str, flight: u64) -> bool {
    self.lock_in_flight().get(key).is_some_and(|f| f.id == flight)
  }

  async fn run_fetch(&self, key: &str, flight: u64, definition: EndpointDefinition) {
    info!(endpoint = %key, "Fetching endpoint");

    let result = AssertUnwindSafe((definition.fetcher)())
      .catch_unwind()
      .await
      .unwrap_or_else(|_| Err(eyre!("Fetcher for '{}' panicked", key)));

    if !self.is_current_flight(key, flight) {
      debug!(endpoint = %key, "Dropping result of a cancelled fetch");
      return;
    }

    match result {
      Ok(data) => {
        let record = CachedRecord::new(data, self.clock.now());

        let backend = self.backends.select(definition.backend);
        if let Err(e) = backend.set(&self.storage_key(key), &record).await {
          // In-memory state stays authoritative
          warn!(endpoint = %key, backend = backend.name(), error = %e, "Failed to persist endpoint data");
        }

        self.store.set(key, |s| s.succeeded(&record));
        info!(endpoint = %key, "Fetched endpoint");
      }
      Err(report) => {
        warn!(endpoint = %key, error = %report, "Fetch failed");
        self.store.set(key, |s| s.failed(FetchError::from(report)));
      }
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    let listener = self
      .signal_listener
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(handle) = listener {
      handle.abort();
    }
  }
}
