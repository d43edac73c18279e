//! Request coordinator that wraps the backend with caching, coalescing, debouncing
//! and retries.

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::Backend;
use super::policy::{EndpointPolicy, PolicyTable};
use crate::cache::{CacheStats, CacheTier, NamespaceConfig, TierKind, TieredCache};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheResult, RequestError};
use crate::key::{Params, RequestKey};
use crate::pipeline::{Debouncer, PrefetchHandle, PrefetchTarget, Prefetcher, RequestBatcher, RetryExecutor};
use crate::schedule::{Scheduler, TokioScheduler};

/// TTL for namespaces created implicitly for cached endpoints.
const DEFAULT_TTL_MILLIS: u64 = 5 * 60 * 1000;
/// Capacity for namespaces created implicitly for cached endpoints.
const DEFAULT_MAX_ENTRIES: usize = 100;

/// Snapshot of the coordinator's shared state.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
  pub cache: CacheStats,
  pub active_batches: usize,
  pub active_debounce_timers: usize,
  pub inflight_prefetches: usize,
}

/// Builder for [`RequestCoordinator`].
pub struct CoordinatorBuilder {
  backend: Arc<dyn Backend>,
  policies: PolicyTable,
  namespaces: Vec<NamespaceConfig>,
  tiers: Vec<(TierKind, Arc<dyn CacheTier>)>,
  clock: Arc<dyn Clock>,
  scheduler: Arc<dyn Scheduler>,
  batch_window: Duration,
  prefetch_grace: Duration,
}

impl CoordinatorBuilder {
  pub fn policies(mut self, policies: PolicyTable) -> Self {
    self.policies = policies;
    self
  }

  pub fn namespaces(mut self, namespaces: Vec<NamespaceConfig>) -> Self {
    self.namespaces = namespaces;
    self
  }

  /// Back one tier kind with a specific store, e.g. a file-backed SQLite database.
  pub fn tier(mut self, kind: TierKind, tier: Arc<dyn CacheTier>) -> Self {
    self.tiers.push((kind, tier));
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
    self.scheduler = scheduler;
    self
  }

  pub fn batch_window(mut self, window: Duration) -> Self {
    self.batch_window = window;
    self
  }

  pub fn prefetch_grace(mut self, grace: Duration) -> Self {
    self.prefetch_grace = grace;
    self
  }

  pub fn build(self) -> CacheResult<RequestCoordinator> {
    let mut namespaces = self.namespaces;
    let mut known: BTreeSet<String> = namespaces.iter().map(|n| n.namespace.clone()).collect();

    // Cached endpoints without a configured namespace get a default memory one.
    for (endpoint, policy) in self.policies.iter() {
      let name = policy.namespace_for(endpoint);
      if policy.cache && known.insert(name.to_string()) {
        debug!(endpoint, namespace = name, "creating default cache namespace");
        namespaces.push(NamespaceConfig::memory(
          name,
          policy.ttl_millis.unwrap_or(DEFAULT_TTL_MILLIS),
          DEFAULT_MAX_ENTRIES,
        ));
      }
    }

    let mut cache = TieredCache::new(namespaces, Arc::clone(&self.clock))?;
    for (kind, tier) in self.tiers {
      cache = cache.with_tier(kind, tier);
    }
    let cache = Arc::new(cache);

    Ok(RequestCoordinator {
      batcher: RequestBatcher::new(
        Arc::clone(&self.backend),
        Arc::clone(&self.scheduler),
        self.batch_window,
      ),
      debouncer: Debouncer::new(Arc::clone(&self.scheduler)),
      retry: RetryExecutor::new(Arc::clone(&self.scheduler)),
      prefetcher: Prefetcher::new(
        Arc::clone(&cache),
        Arc::clone(&self.backend),
        Arc::clone(&self.scheduler),
        self.prefetch_grace,
      ),
      policies: self.policies,
      backend: self.backend,
      cache,
    })
  }
}

/// Entry point for UI call sites.
///
/// Each endpoint's [`EndpointPolicy`] decides which optimizations apply. Construct one
/// per process and share it.
pub struct RequestCoordinator {
  policies: PolicyTable,
  cache: Arc<TieredCache>,
  backend: Arc<dyn Backend>,
  batcher: RequestBatcher,
  debouncer: Debouncer<Value>,
  retry: RetryExecutor,
  prefetcher: Prefetcher,
}

impl RequestCoordinator {
  pub fn builder(backend: Arc<dyn Backend>) -> CoordinatorBuilder {
    CoordinatorBuilder {
      backend,
      policies: PolicyTable::default(),
      namespaces: Vec::new(),
      tiers: Vec::new(),
      clock: Arc::new(SystemClock),
      scheduler: Arc::new(TokioScheduler),
      batch_window: Duration::from_millis(50),
      prefetch_grace: Duration::from_secs(5),
    }
  }

  pub fn cache(&self) -> &Arc<TieredCache> {
    &self.cache
  }

  pub fn policy(&self, endpoint: &str) -> &EndpointPolicy {
    self.policies.get(endpoint)
  }

  /// Fetch and decode a resource.
  pub async fn request<T: DeserializeOwned>(&self, endpoint: &str, params: Params) -> Result<T, RequestError> {
    let value = self.request_value(endpoint, params).await?;
    serde_json::from_value(value).map_err(|e| RequestError::Decode {
      endpoint: endpoint.to_string(),
      message: e.to_string(),
    })
  }

  /// Fetch a resource as raw JSON.
  ///
  /// 1. Cached endpoints answer from the cache when a fresh entry exists
  /// 2. Otherwise the call goes to the batcher or straight to the backend
  /// 3. Debounced endpoints collapse identical calls within the quiet period
  /// 4. The whole pipeline runs under the endpoint's retry policy
  /// 5. Successful responses of cached endpoints are stored; failures never are
  pub async fn request_value(&self, endpoint: &str, params: Params) -> Result<Value, RequestError> {
    let policy = self.policies.get(endpoint);
    let key = RequestKey::new(endpoint, &params);
    let namespace = policy.namespace_for(endpoint);
    let digest = key.digest();

    if policy.cache {
      if let Some(value) = self.cache.get::<Value>(namespace, &digest) {
        debug!(key = %key, "cache hit");
        return Ok(value);
      }
      debug!(key = %key, "cache miss");
    }

    let value = self
      .retry
      .execute(policy.retry.as_ref(), || {
        self.dispatch(endpoint, &key, &params, policy)
      })
      .await?;

    if policy.cache {
      if let Err(e) = self
        .cache
        .set_with_ttl(namespace, &digest, &value, policy.ttl_millis)
      {
        warn!(key = %key, error = %e, "response not cached");
      }
    }

    Ok(value)
  }

  /// One attempt through the batch/direct and debounce stages.
  fn dispatch(
    &self,
    endpoint: &str,
    key: &RequestKey,
    params: &Params,
    policy: &EndpointPolicy,
  ) -> BoxFuture<'static, Result<Value, RequestError>> {
    let endpoint = endpoint.to_string();
    let params = params.clone();

    let execute = if policy.batch {
      let batcher = self.batcher.clone();
      let batch_key = RequestKey::grouped(&endpoint, &params, &policy.batch_group_by);
      async move { batcher.add(&endpoint, &batch_key, params).await }.boxed()
    } else {
      let backend = Arc::clone(&self.backend);
      async move { backend.call(&endpoint, &params).await }.boxed()
    };

    match policy.debounce_millis {
      Some(quiet) => {
        let debouncer = self.debouncer.clone();
        let debounce_key = key.canonical().to_string();
        async move {
          debouncer
            .debounce(&debounce_key, Duration::from_millis(quiet), execute)
            .await
        }
        .boxed()
      }
      None => execute,
    }
  }

  /// Drop one cached response, or the endpoint's whole namespace when `params` is None.
  pub fn invalidate(&self, endpoint: &str, params: Option<&Params>) -> CacheResult<()> {
    let policy = self.policies.get(endpoint);
    if !policy.cache {
      return Ok(());
    }
    let namespace = policy.namespace_for(endpoint);
    match params {
      Some(params) => {
        let key = RequestKey::new(endpoint, params);
        self.cache.delete(namespace, &key.digest())?;
        debug!(key = %key, "invalidated");
      }
      None => {
        self.cache.clear(Some(namespace))?;
        debug!(endpoint, namespace, "invalidated namespace");
      }
    }
    Ok(())
  }

  /// Send a mutation, then invalidate the endpoint and everything its policy lists.
  /// Mutations are neither cached nor retried.
  pub async fn mutate(&self, endpoint: &str, body: &Value) -> Result<Value, RequestError> {
    let response = self.backend.send(endpoint, body).await?;

    let policy = self.policies.get(endpoint);
    let targets = std::iter::once(endpoint).chain(policy.invalidates.iter().map(String::as_str));
    for target in targets {
      if let Err(e) = self.invalidate(target, None) {
        warn!(endpoint = target, error = %e, "invalidation after mutation failed");
      }
    }

    Ok(response)
  }

  /// Warm the cache for a likely next request. Only endpoints whose policy allows
  /// prefetching and caching are fetched; anything else is a no-op.
  pub fn prefetch(&self, endpoint: &str, params: Params) -> PrefetchHandle {
    let policy = self.policies.get(endpoint);
    if !(policy.prefetch && policy.cache) {
      debug!(endpoint, "prefetch not enabled for endpoint");
      return PrefetchHandle::ready();
    }

    self.prefetcher.prefetch(PrefetchTarget {
      endpoint: endpoint.to_string(),
      namespace: policy.namespace_for(endpoint).to_string(),
      ttl_millis: policy.ttl_millis,
      params,
    })
  }

  /// Prefetch every target of an anticipated navigation.
  pub fn prefetch_many<'a, I>(&self, targets: I) -> Vec<PrefetchHandle>
  where
    I: IntoIterator<Item = (&'a str, Params)>,
  {
    targets
      .into_iter()
      .map(|(endpoint, params)| self.prefetch(endpoint, params))
      .collect()
  }

  pub fn performance_stats(&self) -> PerformanceStats {
    PerformanceStats {
      cache: self.cache.stats(),
      active_batches: self.batcher.active(),
      active_debounce_timers: self.debouncer.pending(),
      inflight_prefetches: self.prefetcher.in_flight(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::RetryPolicy;
  use crate::key::params;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingBackend {
    calls: AtomicUsize,
    sends: AtomicUsize,
  }

  #[async_trait]
  impl Backend for CountingBackend {
    async fn call(&self, _endpoint: &str, params: &Params) -> Result<Value, RequestError> {
      let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      Ok(json!({ "call": n, "params": params }))
    }

    async fn call_batch(&self, _endpoint: &str, requests: &[Params]) -> Result<Vec<Value>, RequestError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(requests.iter().map(|p| json!({ "params": p })).collect())
    }

    async fn send(&self, _endpoint: &str, body: &Value) -> Result<Value, RequestError> {
      self.sends.fetch_add(1, Ordering::SeqCst);
      Ok(body.clone())
    }
  }

  fn coordinator(policies: PolicyTable) -> (RequestCoordinator, Arc<CountingBackend>) {
    let backend = Arc::new(CountingBackend {
      calls: AtomicUsize::new(0),
      sends: AtomicUsize::new(0),
    });
    let coordinator = RequestCoordinator::builder(backend.clone())
      .policies(policies)
      .build()
      .unwrap();
    (coordinator, backend)
  }

  #[tokio::test]
  async fn uncached_endpoints_always_hit_backend() {
    let (coordinator, backend) = coordinator(PolicyTable::new());
    coordinator.request_value("/api/leaves", Params::new()).await.unwrap();
    coordinator.request_value("/api/leaves", Params::new()).await.unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn default_namespace_is_created_for_cached_endpoints() {
    let (coordinator, backend) = coordinator(
      PolicyTable::new().with("/api/leave-types", EndpointPolicy::cached()),
    );
    let config = coordinator.cache().namespace("/api/leave-types").unwrap();
    assert_eq!(config.ttl_millis, DEFAULT_TTL_MILLIS);

    coordinator.request_value("/api/leave-types", Params::new()).await.unwrap();
    coordinator.request_value("/api/leave-types", Params::new()).await.unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn typed_requests_decode() {
    #[derive(serde::Deserialize)]
    struct Echo {
      call: usize,
    }
    let (coordinator, _) = coordinator(PolicyTable::new());
    let echo: Echo = coordinator
      .request("/api/employees", params([("id", 1)]))
      .await
      .unwrap();
    assert_eq!(echo.call, 1);

    let err = coordinator
      .request::<Vec<String>>("/api/employees", Params::new())
      .await
      .unwrap_err();
    assert!(matches!(err, RequestError::Decode { .. }));
  }

  #[tokio::test]
  async fn mutation_invalidates_listed_endpoints() {
    let (coordinator, backend) = coordinator(
      PolicyTable::new()
        .with("/api/dashboard/stats", EndpointPolicy::cached())
        .with(
          "/api/leaves",
          EndpointPolicy::default().invalidating(&["/api/dashboard/stats"]),
        ),
    );

    coordinator.request_value("/api/dashboard/stats", Params::new()).await.unwrap();
    coordinator
      .mutate("/api/leaves", &json!({"employee_id": 3, "days": 2}))
      .await
      .unwrap();
    coordinator.request_value("/api/dashboard/stats", Params::new()).await.unwrap();

    assert_eq!(backend.sends.load(Ordering::SeqCst), 1);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn prefetch_respects_policy() {
    let (coordinator, backend) = coordinator(
      PolicyTable::new()
        .with("/api/employees", EndpointPolicy::cached().prefetchable())
        .with("/api/leaves", EndpointPolicy::cached()),
    );

    let handles = coordinator.prefetch_many([
      ("/api/employees", params([("id", 1)])),
      ("/api/leaves", params([("id", 1)])),
    ]);
    for handle in handles {
      handle.wait().await;
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    coordinator
      .request_value("/api/employees", params([("id", 1)]))
      .await
      .unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn idle_coordinator_reports_empty_stats() {
    let (coordinator, _) = coordinator(
      PolicyTable::new().with("/api/reports", EndpointPolicy::cached().in_namespace("reports")),
    );
    let stats = coordinator.performance_stats();
    assert_eq!(stats.active_batches, 0);
    assert_eq!(stats.active_debounce_timers, 0);
    assert_eq!(stats.inflight_prefetches, 0);
    assert_eq!(stats.cache.entries.get("reports"), Some(&0));
  }
}
