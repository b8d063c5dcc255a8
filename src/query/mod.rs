//! Endpoint query engine.
//!
//! Inspired by TanStack Query: callers define named endpoints with a fetch
//! function, subscribe to their state, and the engine fetches, caches and
//! refreshes the data.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::new(EngineOptions::default(), Backends::in_memory());
//!
//! engine
//!   .define_endpoint(
//!     "users",
//!     || async { fetch_users().await },
//!     EndpointOptions::default().with_freshness(Freshness::millis(30_000)),
//!   )
//!   .await;
//!
//! let subscription = engine.subscribe("users", |state| {
//!   if let Some(users) = state.data() {
//!     render(users);
//!   }
//! });
//!
//! // Later
//! engine.refetch("users", true).await;
//! subscription.unsubscribe();
//! ```

mod clock;
mod engine;
mod registry;
mod signals;
mod staleness;
mod state;
mod subscription;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineOptions};
pub use registry::EndpointOptions;
pub use signals::{Signal, Signals};
pub use staleness::{is_stale, Freshness};
pub use state::{EndpointState, EndpointStatus, FetchError};
pub use subscription::Subscription;
