//! Endpoint definitions: fetcher plus per-endpoint options.

use color_eyre::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::staleness::Freshness;
use crate::cache::BackendKind;

/// A factory that creates futures fetching an endpoint's data.
pub(crate) type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Options accepted when defining an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointOptions {
  /// Freshness window; the engine default applies when unset
  pub freshness: Option<Freshness>,
  /// Where fetched data is persisted
  pub backend: BackendKind,
}

impl EndpointOptions {
  pub fn with_freshness(mut self, freshness: Freshness) -> Self {
    self.freshness = Some(freshness);
    self
  }

  pub fn with_backend(mut self, backend: BackendKind) -> Self {
    self.backend = backend;
    self
  }
}

/// A registered endpoint with its options resolved against engine defaults.
#[derive(Clone)]
pub(crate) struct EndpointDefinition {
  pub fetcher: Fetcher,
  pub freshness: Freshness,
  pub backend: BackendKind,
}

#[derive(Default)]
pub(crate) struct EndpointRegistry {
  endpoints: Mutex<HashMap<String, EndpointDefinition>>,
}

impl EndpointRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register or replace the definition for `key`.
  ///
  /// Returns the replaced definition, if any.
  pub fn define(&self, key: &str, definition: EndpointDefinition) -> Option<EndpointDefinition> {
    self
      .endpoints
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.to_string(), definition)
  }

  pub fn get(&self, key: &str) -> Option<EndpointDefinition> {
    self
      .endpoints
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
  }
}
