//! Data-fetching and caching engine for named endpoints.
//!
//! - Caches fetched data in a volatile, small persistent or bulk persistent backend
//! - Tracks staleness against a per-endpoint freshness window
//! - Deduplicates concurrent fetches of the same endpoint (single-flight)
//! - Notifies subscribers on every state change
//! - Refreshes observed endpoints when the host regains visibility or connectivity

pub mod cache;
pub mod config;
pub mod query;

pub use cache::{BackendKind, Backends, CacheBackend, CachedRecord};
pub use config::Config;
pub use query::{
  Engine, EngineOptions, EndpointOptions, EndpointState, EndpointStatus, FetchError, Freshness,
  Signal, Signals, Subscription,
};
