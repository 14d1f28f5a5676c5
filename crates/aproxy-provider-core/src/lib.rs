//! Core routing abstractions: the adapter trait plus the shared mutable
//! state (cooldowns, thread affinity, stats) the router selects against.
//!
//! This crate does not depend on axum or any concrete HTTP client; adapters
//! live in `aproxy-provider-impl` and IO happens there.

pub mod adapter;
pub mod affinity;
pub mod cooldown;
pub mod headers;
pub mod pool;
pub mod router;
pub mod stats;

pub use adapter::{AdapterBody, AdapterError, AdapterResponse, ForwardRequest, ProviderAdapter};
pub use affinity::{AffinityEntry, AffinityMap};
pub use cooldown::{CooldownTracker, RetryAfter, parse_retry_after};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use pool::{ClientProvider, Pool};
pub use router::{RouteResult, Router};
pub use stats::{RequestEntry, StatsRing, StatsSnapshot};
