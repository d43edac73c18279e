//! Core traits and types for the caching system.

use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

/// Which backing store a namespace lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
  /// Process-local hash map
  Memory,
  /// SQLite file that survives restarts
  Persistent,
  /// In-memory SQLite database scoped to this session
  Session,
}

/// Per-namespace cache policy. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
  pub namespace: String,
  #[serde(default = "default_tier")]
  pub tier: TierKind,
  pub ttl_millis: u64,
  pub max_entries: usize,
  #[serde(default)]
  pub compress: bool,
}

fn default_tier() -> TierKind {
  TierKind::Memory
}

impl NamespaceConfig {
  pub fn memory(namespace: &str, ttl_millis: u64, max_entries: usize) -> Self {
    Self {
      namespace: namespace.to_string(),
      tier: TierKind::Memory,
      ttl_millis,
      max_entries,
      compress: false,
    }
  }

  pub fn with_tier(mut self, tier: TierKind) -> Self {
    self.tier = tier;
    self
  }

  pub fn compressed(mut self) -> Self {
    self.compress = true;
    self
  }
}

/// An entry as held by a tier.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
  pub key: String,
  /// Serialized JSON, zstd-compressed when `compressed` is set
  pub payload: Vec<u8>,
  pub compressed: bool,
  /// Epoch millis at write time
  pub created_at: i64,
  pub ttl_millis: u64,
}

impl StoredEntry {
  /// An entry is expired once its full TTL has elapsed.
  pub fn is_expired(&self, now: i64) -> bool {
    let age = now.saturating_sub(self.created_at).max(0) as u64;
    age >= self.ttl_millis
  }
}

/// What a bounded write removed to make room.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
  pub purged: usize,
  pub evicted: usize,
}

/// A backing store for cache entries.
///
/// Every operation is scoped to a namespace. Implementations serialize their own
/// access; eviction and reads/writes never interleave within a tier.
pub trait CacheTier: Send + Sync {
  /// Fetch an entry without checking expiry.
  fn read(&self, namespace: &str, key: &str) -> CacheResult<Option<StoredEntry>>;

  /// Insert or replace an entry. May fail with `CacheError::QuotaExceeded`.
  fn write(&self, namespace: &str, entry: StoredEntry) -> CacheResult<()>;

  /// Insert or replace an entry while keeping the namespace at `max_entries` or fewer.
  /// A new key first displaces expired entries, then the oldest ones. The whole step is
  /// atomic with respect to every other operation on the tier.
  fn write_bounded(
    &self,
    namespace: &str,
    entry: StoredEntry,
    max_entries: usize,
    now: i64,
  ) -> CacheResult<Admission>;

  /// Remove one entry. Returns whether it existed.
  fn remove(&self, namespace: &str, key: &str) -> CacheResult<bool>;

  /// Remove every entry in the namespace.
  fn clear(&self, namespace: &str) -> CacheResult<()>;

  fn contains(&self, namespace: &str, key: &str) -> CacheResult<bool> {
    Ok(self.read(namespace, key)?.is_some())
  }

  fn len(&self, namespace: &str) -> CacheResult<usize>;

  /// Drop all entries expired at `now`. Returns how many were removed.
  fn purge_expired(&self, namespace: &str, now: i64) -> CacheResult<usize>;

  /// Drop up to `count` entries, oldest `created_at` first. Returns how many were removed.
  fn evict_oldest(&self, namespace: &str, count: usize) -> CacheResult<usize>;
}
