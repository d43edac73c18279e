//! End-to-end behaviour of the request coordinator against a scripted backend.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use leavedesk::cache::{MemoryTier, SqliteTier};
use leavedesk::clock::ManualClock;
use leavedesk::{
  params, Backend, EndpointPolicy, NamespaceConfig, Params, PolicyTable, RequestCoordinator,
  RequestError, RequestKey, RetryPolicy, TierKind,
};

#[derive(Default)]
struct ScriptedBackend {
  calls: Mutex<Vec<(String, Params)>>,
  batches: Mutex<Vec<(String, Vec<Params>)>>,
  fail_batches: AtomicBool,
  always_fail: AtomicBool,
  /// canonical request key -> failures still to return
  failures_left: Mutex<HashMap<String, u32>>,
}

impl ScriptedBackend {
  fn fail_next(&self, endpoint: &str, params: &Params, times: u32) {
    let key = RequestKey::new(endpoint, params).canonical().to_string();
    self.failures_left.lock().unwrap().insert(key, times);
  }

  fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  fn batch_count(&self) -> usize {
    self.batches.lock().unwrap().len()
  }

  fn respond(endpoint: &str, params: &Params) -> Value {
    json!({ "endpoint": endpoint, "params": params })
  }
}

#[async_trait]
impl Backend for ScriptedBackend {
  async fn call(&self, endpoint: &str, params: &Params) -> Result<Value, RequestError> {
    self
      .calls
      .lock()
      .unwrap()
      .push((endpoint.to_string(), params.clone()));

    if self.always_fail.load(Ordering::SeqCst) {
      return Err(RequestError::network(endpoint, "connection refused"));
    }
    let key = RequestKey::new(endpoint, params).canonical().to_string();
    if let Some(left) = self.failures_left.lock().unwrap().get_mut(&key) {
      if *left > 0 {
        *left -= 1;
        return Err(RequestError::Status {
          endpoint: endpoint.to_string(),
          status: 503,
        });
      }
    }
    Ok(Self::respond(endpoint, params))
  }

  async fn call_batch(&self, endpoint: &str, requests: &[Params]) -> Result<Vec<Value>, RequestError> {
    self
      .batches
      .lock()
      .unwrap()
      .push((endpoint.to_string(), requests.to_vec()));

    if self.fail_batches.load(Ordering::SeqCst) {
      return Err(RequestError::batch(endpoint, "HTTP 500"));
    }
    Ok(requests.iter().map(|p| Self::respond(endpoint, p)).collect())
  }

  async fn send(&self, _endpoint: &str, body: &Value) -> Result<Value, RequestError> {
    Ok(json!({ "ok": true, "echo": body }))
  }
}

struct Harness {
  coordinator: Arc<RequestCoordinator>,
  backend: Arc<ScriptedBackend>,
  clock: Arc<ManualClock>,
}

fn harness(policies: PolicyTable, namespaces: Vec<NamespaceConfig>) -> Harness {
  harness_with(policies, namespaces, |builder| builder)
}

fn harness_with(
  policies: PolicyTable,
  namespaces: Vec<NamespaceConfig>,
  customize: impl FnOnce(leavedesk::api::CoordinatorBuilder) -> leavedesk::api::CoordinatorBuilder,
) -> Harness {
  let backend = Arc::new(ScriptedBackend::default());
  let clock = Arc::new(ManualClock::new(1_700_000_000_000));
  let builder = RequestCoordinator::builder(backend.clone())
    .policies(policies)
    .namespaces(namespaces)
    .clock(clock.clone())
    .batch_window(Duration::from_millis(50));
  let coordinator = customize(builder).build().unwrap();
  Harness {
    coordinator: Arc::new(coordinator),
    backend,
    clock,
  }
}

fn employees_policy() -> PolicyTable {
  PolicyTable::new().with(
    "/api/employees",
    EndpointPolicy::cached().in_namespace("employees"),
  )
}

fn employees_namespace() -> Vec<NamespaceConfig> {
  vec![NamespaceConfig::memory("employees", 60_000, 50)]
}

#[tokio::test]
async fn repeated_reads_within_ttl_call_upstream_once() {
  let h = harness(employees_policy(), employees_namespace());

  for _ in 0..5 {
    let value = h
      .coordinator
      .request_value("/api/employees", params([("id", 42)]))
      .await
      .unwrap();
    assert_eq!(value["params"]["id"], 42);
  }

  assert_eq!(h.backend.call_count(), 1);
  let stats = h.coordinator.performance_stats();
  assert_eq!(stats.cache.hits, 4);
  assert_eq!(stats.cache.misses, 1);
}

#[tokio::test]
async fn expired_entries_are_fetched_again() {
  let h = harness(employees_policy(), employees_namespace());
  let p = params([("id", 1)]);

  h.coordinator.request_value("/api/employees", p.clone()).await.unwrap();
  h.clock.advance(Duration::from_millis(59_999));
  h.coordinator.request_value("/api/employees", p.clone()).await.unwrap();
  assert_eq!(h.backend.call_count(), 1);

  h.clock.advance(Duration::from_millis(1));
  h.coordinator.request_value("/api/employees", p).await.unwrap();
  assert_eq!(h.backend.call_count(), 2);
}

#[tokio::test]
async fn policy_ttl_overrides_namespace_ttl() {
  let h = harness(
    PolicyTable::new().with(
      "/api/dashboard/stats",
      EndpointPolicy::cached()
        .in_namespace("employees")
        .with_ttl(Duration::from_millis(1_000)),
    ),
    employees_namespace(),
  );

  h.coordinator.request_value("/api/dashboard/stats", Params::new()).await.unwrap();
  h.clock.advance(Duration::from_millis(1_000));
  h.coordinator.request_value("/api/dashboard/stats", Params::new()).await.unwrap();
  assert_eq!(h.backend.call_count(), 2);
}

#[tokio::test]
async fn invalidate_forces_a_fresh_call() {
  let h = harness(employees_policy(), employees_namespace());
  let one = params([("id", 1)]);
  let two = params([("id", 2)]);

  h.coordinator.request_value("/api/employees", one.clone()).await.unwrap();
  h.coordinator.request_value("/api/employees", two.clone()).await.unwrap();

  h.coordinator.invalidate("/api/employees", Some(&one)).unwrap();
  h.coordinator.request_value("/api/employees", one.clone()).await.unwrap();
  h.coordinator.request_value("/api/employees", two.clone()).await.unwrap();
  assert_eq!(h.backend.call_count(), 3);

  h.coordinator.invalidate("/api/employees", None).unwrap();
  h.coordinator.request_value("/api/employees", one).await.unwrap();
  h.coordinator.request_value("/api/employees", two).await.unwrap();
  assert_eq!(h.backend.call_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn concurrent_batched_requests_share_one_upstream_call() {
  let h = harness(
    PolicyTable::new().with("/api/employees", EndpointPolicy::cached().batched()),
    vec![],
  );

  let calls = (1..=5).map(|id| {
    let coordinator = Arc::clone(&h.coordinator);
    async move {
      tokio::time::sleep(Duration::from_millis(id * 2)).await;
      coordinator
        .request_value("/api/employees", params([("id", id as i64)]))
        .await
    }
  });
  let results = join_all(calls).await;

  let batches = h.backend.batches.lock().unwrap().clone();
  assert_eq!(batches.len(), 1);
  assert_eq!(
    batches[0].1,
    (1..=5).map(|id| params([("id", id)])).collect::<Vec<_>>()
  );
  for (i, result) in results.iter().enumerate() {
    assert_eq!(result.as_ref().unwrap()["params"]["id"], i as i64 + 1);
  }
  assert_eq!(h.backend.call_count(), 0);

  // each demultiplexed result was cached under its own key
  h.coordinator
    .request_value("/api/employees", params([("id", 3)]))
    .await
    .unwrap();
  assert_eq!(h.backend.batch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_batch_falls_back_to_individually_retried_calls() {
  let h = harness(
    PolicyTable::new().with(
      "/api/employees",
      EndpointPolicy::default()
        .batched()
        .with_retry(RetryPolicy::new(2, 100, 2.0)),
    ),
    vec![],
  );
  h.backend.fail_batches.store(true, Ordering::SeqCst);
  h.backend.fail_next("/api/employees", &params([("id", 3)]), 1);

  let calls = (1..=4).map(|id| {
    let coordinator = Arc::clone(&h.coordinator);
    async move {
      coordinator
        .request_value("/api/employees", params([("id", id)]))
        .await
    }
  });
  let results = join_all(calls).await;

  assert!(results.iter().all(|r| r.is_ok()));
  // first batch fell back for all four; id 3 retried through a second batch
  assert_eq!(h.backend.batch_count(), 2);
  assert_eq!(h.backend.call_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn batch_fallback_failures_stay_independent() {
  let h = harness(
    PolicyTable::new().with("/api/employees", EndpointPolicy::default().batched()),
    vec![],
  );
  h.backend.fail_batches.store(true, Ordering::SeqCst);
  h.backend.fail_next("/api/employees", &params([("id", 2)]), 1);

  let (a, b) = tokio::join!(
    h.coordinator.request_value("/api/employees", params([("id", 1)])),
    h.coordinator.request_value("/api/employees", params([("id", 2)])),
  );

  assert!(a.is_ok());
  assert!(matches!(b, Err(RequestError::Status { status: 503, .. })));
}

#[tokio::test(start_paused = true)]
async fn debounced_endpoint_collapses_a_burst() {
  let h = harness(
    PolicyTable::new().with(
      "/api/leaves/search",
      EndpointPolicy::default().debounced(Duration::from_millis(300)),
    ),
    vec![],
  );

  let calls = (1..=10u64).map(|n| {
    let coordinator = Arc::clone(&h.coordinator);
    async move {
      tokio::time::sleep(Duration::from_millis(n * 25)).await;
      coordinator
        .request_value("/api/leaves/search", params([("q", "annual")]))
        .await
    }
  });
  let results = join_all(calls).await;

  assert_eq!(h.backend.call_count(), 1);
  let first = results[0].clone().unwrap();
  assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
  assert_eq!(h.coordinator.performance_stats().active_debounce_timers, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_and_are_not_cached() {
  let h = harness(
    PolicyTable::new().with(
      "/api/employees",
      EndpointPolicy::cached()
        .in_namespace("employees")
        .with_retry(RetryPolicy::new(3, 100, 2.0)),
    ),
    employees_namespace(),
  );
  h.backend.always_fail.store(true, Ordering::SeqCst);

  let start = tokio::time::Instant::now();
  let err = h
    .coordinator
    .request_value("/api/employees", params([("id", 9)]))
    .await
    .unwrap_err();

  assert_eq!(start.elapsed(), Duration::from_millis(700));
  match err {
    RequestError::RetryExhausted { attempts, last } => {
      assert_eq!(attempts, 4);
      assert!(matches!(*last, RequestError::Network { .. }));
    }
    other => panic!("expected RetryExhausted, got {:?}", other),
  }
  assert_eq!(h.backend.call_count(), 4);

  h.backend.always_fail.store(false, Ordering::SeqCst);
  h.coordinator
    .request_value("/api/employees", params([("id", 9)]))
    .await
    .unwrap();
  assert_eq!(h.backend.call_count(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn namespace_bound_holds_across_worker_threads() {
  for tier in [TierKind::Memory, TierKind::Persistent] {
    let h = harness(
      employees_policy(),
      vec![NamespaceConfig::memory("employees", 60_000, 3).with_tier(tier)],
    );

    let tasks: Vec<_> = (0..64)
      .map(|id| {
        let coordinator = Arc::clone(&h.coordinator);
        tokio::spawn(async move {
          coordinator
            .request_value("/api/employees", params([("id", id)]))
            .await
            .map(|_| coordinator.performance_stats().cache.entries["employees"])
        })
      })
      .collect();

    for task in tasks {
      let held = task.await.unwrap().unwrap();
      assert!(held <= 3, "{:?} namespace held {} entries", tier, held);
    }
    let stats = h.coordinator.performance_stats().cache;
    assert_eq!(stats.entries["employees"], 3);
    assert_eq!(stats.writes, 64);
    assert_eq!(stats.evictions, 61);
  }
}

#[tokio::test]
async fn cache_write_failure_does_not_fail_the_request() {
  let h = harness_with(employees_policy(), employees_namespace(), |builder| {
    builder.tier(TierKind::Memory, Arc::new(MemoryTier::with_byte_quota(16)))
  });

  let value = h
    .coordinator
    .request_value("/api/employees", params([("id", 1)]))
    .await
    .unwrap();
  assert_eq!(value["endpoint"], "/api/employees");

  let stats = h.coordinator.performance_stats();
  assert_eq!(stats.cache.write_failures, 1);
  assert_eq!(stats.cache.entries["employees"], 0);
}

#[tokio::test]
async fn prefetched_responses_short_circuit_requests() {
  let h = harness(
    PolicyTable::new().with(
      "/api/employees",
      EndpointPolicy::cached().in_namespace("employees").prefetchable(),
    ),
    employees_namespace(),
  );

  h.coordinator
    .prefetch("/api/employees", params([("id", 5)]))
    .wait()
    .await;
  assert_eq!(h.backend.call_count(), 1);

  h.coordinator
    .request_value("/api/employees", params([("id", 5)]))
    .await
    .unwrap();
  assert_eq!(h.backend.call_count(), 1);
  assert_eq!(h.coordinator.performance_stats().cache.hits, 1);
}

#[tokio::test]
async fn prefetch_failures_are_silent() {
  let h = harness(
    PolicyTable::new().with(
      "/api/employees",
      EndpointPolicy::cached().in_namespace("employees").prefetchable(),
    ),
    employees_namespace(),
  );
  h.backend.always_fail.store(true, Ordering::SeqCst);

  h.coordinator
    .prefetch("/api/employees", params([("id", 5)]))
    .wait()
    .await;
  assert_eq!(h.coordinator.performance_stats().cache.entries["employees"], 0);
}

#[tokio::test]
async fn persistent_namespace_survives_a_new_coordinator() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("cache.db");
  let namespaces = vec![
    NamespaceConfig::memory("leave_types", 600_000, 20)
      .with_tier(TierKind::Persistent)
      .compressed(),
  ];
  let policies = PolicyTable::new().with(
    "/api/leave-types",
    EndpointPolicy::cached().in_namespace("leave_types"),
  );

  let first = harness_with(policies.clone(), namespaces.clone(), |builder| {
    builder.tier(TierKind::Persistent, Arc::new(SqliteTier::open(&path).unwrap()))
  });
  first
    .coordinator
    .request_value("/api/leave-types", Params::new())
    .await
    .unwrap();
  assert_eq!(first.backend.call_count(), 1);

  let second = harness_with(policies, namespaces, |builder| {
    builder.tier(TierKind::Persistent, Arc::new(SqliteTier::open(&path).unwrap()))
  });
  let value = second
    .coordinator
    .request_value("/api/leave-types", Params::new())
    .await
    .unwrap();
  assert_eq!(value["endpoint"], "/api/leave-types");
  assert_eq!(second.backend.call_count(), 0);
}

#[tokio::test]
async fn mutation_clears_dependent_caches() {
  let h = harness(
    PolicyTable::new()
      .with("/api/employees", EndpointPolicy::cached().in_namespace("employees"))
      .with(
        "/api/leaves",
        EndpointPolicy::default().invalidating(&["/api/employees"]),
      ),
    employees_namespace(),
  );

  h.coordinator.request_value("/api/employees", params([("id", 1)])).await.unwrap();
  let response = h
    .coordinator
    .mutate("/api/leaves", &json!({"employee_id": 1, "days": 3}))
    .await
    .unwrap();
  assert_eq!(response["ok"], true);

  h.coordinator.request_value("/api/employees", params([("id", 1)])).await.unwrap();
  assert_eq!(h.backend.call_count(), 2);
}
