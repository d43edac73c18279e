//! Client-side request optimization for the leave-management admin API.
//!
//! [`RequestCoordinator`] sits between UI call sites and the HTTP API and applies a
//! per-endpoint policy: tiered caching with TTL and capacity bounds, coalescing of
//! concurrent calls into batches, debouncing, retry with exponential backoff, and
//! cache-warming prefetches.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod pipeline;
pub mod schedule;

pub use api::{Backend, EndpointPolicy, HttpBackend, PolicyTable, RequestCoordinator, RetryPolicy};
pub use cache::{NamespaceConfig, TierKind, TieredCache};
pub use error::{CacheError, RequestError};
pub use key::{params, Params, RequestKey, Scalar};
