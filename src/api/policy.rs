//! Declarative per-endpoint request policies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Exponential backoff settings.
///
/// `max_attempts` counts retries after the first attempt, so an always-failing call is
/// made `max_attempts + 1` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay_millis: u64,
  pub backoff_factor: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_millis: 100,
      backoff_factor: 2.0,
    }
  }
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay_millis: u64, backoff_factor: f64) -> Self {
    Self {
      max_attempts,
      base_delay_millis,
      backoff_factor,
    }
  }

  /// Wait after failed attempt `attempt` (0-indexed): `base * factor^attempt`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let millis = self.base_delay_millis as f64 * self.backoff_factor.powi(exponent);
    if millis.is_finite() && millis > 0.0 {
      Duration::from_millis(millis as u64)
    } else {
      Duration::ZERO
    }
  }
}

/// How requests to one endpoint are optimized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPolicy {
  /// Serve from and store into the cache
  pub cache: bool,
  /// Cache namespace; defaults to the endpoint itself
  pub namespace: Option<String>,
  /// Per-entry TTL overriding the namespace TTL
  pub ttl_millis: Option<u64>,
  /// Collapse identical calls arriving within this quiet period
  pub debounce_millis: Option<u64>,
  /// Coalesce concurrent calls into one batched upstream request
  pub batch: bool,
  /// Params that must match for two calls to share a batch
  pub batch_group_by: Vec<String>,
  /// Allow speculative fetches that warm the cache
  pub prefetch: bool,
  pub retry: Option<RetryPolicy>,
  /// Endpoints whose cached data a mutation of this endpoint makes stale
  pub invalidates: Vec<String>,
}

impl EndpointPolicy {
  pub fn cached() -> Self {
    Self {
      cache: true,
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl_millis = Some(ttl.as_millis() as u64);
    self
  }

  pub fn in_namespace(mut self, namespace: &str) -> Self {
    self.namespace = Some(namespace.to_string());
    self
  }

  pub fn debounced(mut self, quiet: Duration) -> Self {
    self.debounce_millis = Some(quiet.as_millis() as u64);
    self
  }

  pub fn batched(mut self) -> Self {
    self.batch = true;
    self
  }

  pub fn prefetchable(mut self) -> Self {
    self.prefetch = true;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }

  pub fn invalidating(mut self, endpoints: &[&str]) -> Self {
    self.invalidates = endpoints.iter().map(|e| e.to_string()).collect();
    self
  }

  pub fn namespace_for<'a>(&'a self, endpoint: &'a str) -> &'a str {
    self.namespace.as_deref().unwrap_or(endpoint)
  }
}

/// Read-only endpoint -> policy table. Unknown endpoints get the default policy:
/// no cache, no batching, no debounce, no retry.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
  endpoints: HashMap<String, EndpointPolicy>,
  fallback: EndpointPolicy,
}

impl PolicyTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, endpoint: &str, policy: EndpointPolicy) -> Self {
    self.endpoints.insert(endpoint.to_string(), policy);
    self
  }

  pub fn get(&self, endpoint: &str) -> &EndpointPolicy {
    self.endpoints.get(endpoint).unwrap_or(&self.fallback)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &EndpointPolicy)> {
    self.endpoints.iter().map(|(k, v)| (k.as_str(), v))
  }
}

impl FromIterator<(String, EndpointPolicy)> for PolicyTable {
  fn from_iter<I: IntoIterator<Item = (String, EndpointPolicy)>>(iter: I) -> Self {
    Self {
      endpoints: iter.into_iter().collect(),
      fallback: EndpointPolicy::default(),
    }
  }
}
