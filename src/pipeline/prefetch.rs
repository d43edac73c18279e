//! Speculative fetches that warm the cache ahead of navigation.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::Backend;
use crate::cache::TieredCache;
use crate::key::{Params, RequestKey};
use crate::schedule::Scheduler;

type InFlight = Shared<BoxFuture<'static, ()>>;
type Memo = Arc<Mutex<HashMap<String, InFlight>>>;

fn lock(memo: &Mutex<HashMap<String, InFlight>>) -> MutexGuard<'_, HashMap<String, InFlight>> {
  memo.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a prefetched response should land.
#[derive(Debug, Clone)]
pub struct PrefetchTarget {
  pub endpoint: String,
  pub params: Params,
  pub namespace: String,
  pub ttl_millis: Option<u64>,
}

/// Optional handle on a running prefetch. Dropping it does not stop the fetch.
#[must_use = "prefetches run regardless; await the handle only if you need to"]
pub struct PrefetchHandle {
  inner: Option<InFlight>,
}

impl PrefetchHandle {
  pub fn ready() -> Self {
    Self { inner: None }
  }

  /// Wait for the prefetch to finish. Never fails.
  pub async fn wait(self) {
    if let Some(inner) = self.inner {
      inner.await;
    }
  }
}

/// Fire-and-forget cache warmer.
///
/// Concurrent prefetches of the same request share one in-flight fetch. Results land
/// in the cache under the same key a real request would look up; errors are logged and
/// dropped. Memo entries are released a grace period after the fetch settles.
#[derive(Clone)]
pub struct Prefetcher {
  cache: Arc<TieredCache>,
  backend: Arc<dyn Backend>,
  scheduler: Arc<dyn Scheduler>,
  grace: Duration,
  inflight: Memo,
}

impl Prefetcher {
  pub fn new(
    cache: Arc<TieredCache>,
    backend: Arc<dyn Backend>,
    scheduler: Arc<dyn Scheduler>,
    grace: Duration,
  ) -> Self {
    Self {
      cache,
      backend,
      scheduler,
      grace,
      inflight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn prefetch(&self, target: PrefetchTarget) -> PrefetchHandle {
    let key = RequestKey::new(&target.endpoint, &target.params);
    let digest = key.digest();

    if self.cache.contains(&target.namespace, &digest) {
      debug!(key = %key, "already cached, skipping prefetch");
      return PrefetchHandle::ready();
    }

    let mut inflight = lock(&self.inflight);
    if let Some(existing) = inflight.get(key.canonical()) {
      return PrefetchHandle {
        inner: Some(existing.clone()),
      };
    }

    let fetch = self.fetch(target, key.canonical().to_string(), digest);
    inflight.insert(key.canonical().to_string(), fetch.clone());
    tokio::spawn(fetch.clone());

    PrefetchHandle { inner: Some(fetch) }
  }

  /// Number of memoized prefetches, running or within their grace period.
  pub fn in_flight(&self) -> usize {
    lock(&self.inflight).len()
  }

  fn fetch(&self, target: PrefetchTarget, memo_key: String, digest: String) -> InFlight {
    let cache = Arc::clone(&self.cache);
    let backend = Arc::clone(&self.backend);
    let scheduler = Arc::clone(&self.scheduler);
    let memo = Arc::clone(&self.inflight);
    let grace = self.grace;

    async move {
      let PrefetchTarget {
        endpoint,
        params,
        namespace,
        ttl_millis,
      } = target;

      match backend.call(&endpoint, &params).await {
        Ok(value) => match cache.set_with_ttl(&namespace, &digest, &value, ttl_millis) {
          Ok(()) => debug!(endpoint = %endpoint, "prefetched"),
          Err(e) => warn!(endpoint = %endpoint, error = %e, "prefetched response not cached"),
        },
        Err(e) => warn!(endpoint = %endpoint, error = %e, "prefetch failed"),
      }

      let _release = scheduler.after(
        grace,
        Box::pin(async move {
          lock(&memo).remove(&memo_key);
        }),
      );
    }
    .boxed()
    .shared()
  }
}
