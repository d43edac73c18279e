//! Request shaping stages the coordinator composes per endpoint policy.

mod batch;
mod debounce;
mod prefetch;
mod retry;

pub use batch::RequestBatcher;
pub use debounce::Debouncer;
pub use prefetch::{PrefetchHandle, PrefetchTarget, Prefetcher};
pub use retry::RetryExecutor;
