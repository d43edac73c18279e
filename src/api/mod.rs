//! Access to the admin API: the backend contract, endpoint policies and the
//! coordinating client that applies them.

mod client;
mod coordinator;
mod policy;

pub use client::{Backend, HttpBackend};
pub use coordinator::{CoordinatorBuilder, PerformanceStats, RequestCoordinator};
pub use policy::{EndpointPolicy, PolicyTable, RetryPolicy};
