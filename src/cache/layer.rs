//! Tiered cache that routes each namespace to its configured backing store.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::codec;
use super::storage::{MemoryTier, SqliteTier};
use super::traits::{Admission, CacheTier, NamespaceConfig, StoredEntry, TierKind};
use crate::clock::Clock;
use crate::error::{CacheError, CacheResult};

#[derive(Debug, Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  writes: AtomicU64,
  write_failures: AtomicU64,
  evictions: AtomicU64,
  expirations: AtomicU64,
}

impl Counters {
  fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
  }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub writes: u64,
  pub write_failures: u64,
  pub evictions: u64,
  pub expirations: u64,
  /// Live entry count per namespace (expired-but-unpurged entries included)
  pub entries: BTreeMap<String, usize>,
}

/// Key/value cache partitioned into namespaces, each with its own tier, TTL and
/// capacity bound.
///
/// Values go in and come out by value; callers never see a tier's internal entry.
pub struct TieredCache {
  namespaces: HashMap<String, NamespaceConfig>,
  tiers: HashMap<TierKind, Arc<dyn CacheTier>>,
  clock: Arc<dyn Clock>,
  counters: Counters,
}

impl TieredCache {
  /// Create a cache for the given namespaces.
  ///
  /// Persistent namespaces use a session-scoped database until a file-backed tier is
  /// installed with [`TieredCache::with_tier`].
  pub fn new(namespaces: Vec<NamespaceConfig>, clock: Arc<dyn Clock>) -> CacheResult<Self> {
    let mut tiers: HashMap<TierKind, Arc<dyn CacheTier>> = HashMap::new();
    tiers.insert(TierKind::Memory, Arc::new(MemoryTier::new()));
    tiers.insert(TierKind::Session, Arc::new(SqliteTier::in_memory()?));
    tiers.insert(TierKind::Persistent, Arc::new(SqliteTier::in_memory()?));

    Ok(Self {
      namespaces: namespaces
        .into_iter()
        .map(|cfg| (cfg.namespace.clone(), cfg))
        .collect(),
      tiers,
      clock,
      counters: Counters::default(),
    })
  }

  /// Replace the store backing one tier kind.
  pub fn with_tier(mut self, kind: TierKind, tier: Arc<dyn CacheTier>) -> Self {
    self.tiers.insert(kind, tier);
    self
  }

  pub fn namespace(&self, namespace: &str) -> Option<&NamespaceConfig> {
    self.namespaces.get(namespace)
  }

  fn resolve(&self, namespace: &str) -> CacheResult<(&NamespaceConfig, &Arc<dyn CacheTier>)> {
    let cfg = self
      .namespaces
      .get(namespace)
      .ok_or_else(|| CacheError::UnknownNamespace(namespace.to_string()))?;
    // every TierKind is populated in `new`
    let tier = self
      .tiers
      .get(&cfg.tier)
      .ok_or_else(|| CacheError::UnknownNamespace(namespace.to_string()))?;
    Ok((cfg, tier))
  }

  /// Look up a value. Expired, missing and unreadable entries are all a miss.
  pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
    let (_, tier) = match self.resolve(namespace) {
      Ok(found) => found,
      Err(e) => {
        warn!(error = %e, "cache lookup against unknown namespace");
        return None;
      }
    };

    let entry = match tier.read(namespace, key) {
      Ok(Some(entry)) => entry,
      Ok(None) => {
        Counters::bump(&self.counters.misses, 1);
        return None;
      }
      Err(e) => {
        warn!(namespace, key, error = %e, "cache read failed, treating as miss");
        Counters::bump(&self.counters.misses, 1);
        return None;
      }
    };

    if entry.is_expired(self.clock.now_millis()) {
      debug!(namespace, key, "cache entry expired");
      self.discard(namespace, tier, key);
      Counters::bump(&self.counters.expirations, 1);
      Counters::bump(&self.counters.misses, 1);
      return None;
    }

    match codec::decode(&entry.payload, entry.compressed) {
      Ok(value) => {
        Counters::bump(&self.counters.hits, 1);
        Some(value)
      }
      Err(e) => {
        let err = CacheError::Read {
          namespace: namespace.to_string(),
          key: key.to_string(),
          message: e.to_string(),
        };
        warn!(error = %err, "dropping unreadable cache entry");
        self.discard(namespace, tier, key);
        Counters::bump(&self.counters.misses, 1);
        None
      }
    }
  }

  /// Whether a fresh entry exists, without decoding it or touching hit/miss counters.
  pub fn contains(&self, namespace: &str, key: &str) -> bool {
    let Ok((_, tier)) = self.resolve(namespace) else {
      return false;
    };
    matches!(
      tier.read(namespace, key),
      Ok(Some(entry)) if !entry.is_expired(self.clock.now_millis())
    )
  }

  /// Store a value with the namespace TTL.
  pub fn set<T: Serialize + ?Sized>(&self, namespace: &str, key: &str, value: &T) -> CacheResult<()> {
    self.set_with_ttl(namespace, key, value, None)
  }

  /// Store a value, optionally overriding the namespace TTL for this entry.
  pub fn set_with_ttl<T: Serialize + ?Sized>(
    &self,
    namespace: &str,
    key: &str,
    value: &T,
    ttl_millis: Option<u64>,
  ) -> CacheResult<()> {
    let (cfg, tier) = self.resolve(namespace)?;
    if cfg.max_entries == 0 {
      debug!(namespace, "namespace holds no entries, skipping write");
      return Ok(());
    }

    let (payload, compressed) = codec::encode(value, cfg.compress)?;
    let now = self.clock.now_millis();
    let entry = StoredEntry {
      key: key.to_string(),
      payload,
      compressed,
      created_at: now,
      ttl_millis: ttl_millis.unwrap_or(cfg.ttl_millis),
    };

    let first = match tier.write_bounded(namespace, entry.clone(), cfg.max_entries, now) {
      Ok(admission) => {
        self.record_write(namespace, admission);
        return Ok(());
      }
      Err(e) => e,
    };

    debug!(namespace, key, error = %first, "cache write failed, evicting and retrying once");
    if let Err(e) = self.eviction_pass(cfg, tier) {
      warn!(namespace, error = %e, "eviction pass failed");
    }

    match tier.write_bounded(namespace, entry, cfg.max_entries, self.clock.now_millis()) {
      Ok(admission) => {
        self.record_write(namespace, admission);
        Ok(())
      }
      Err(second) => {
        Counters::bump(&self.counters.write_failures, 1);
        Err(CacheError::Write {
          namespace: namespace.to_string(),
          key: key.to_string(),
          source: Box::new(second),
        })
      }
    }
  }

  /// Remove one entry. Returns whether it existed.
  pub fn delete(&self, namespace: &str, key: &str) -> CacheResult<bool> {
    let (_, tier) = self.resolve(namespace)?;
    tier.remove(namespace, key)
  }

  /// Clear one namespace, or all of them.
  pub fn clear(&self, namespace: Option<&str>) -> CacheResult<()> {
    match namespace {
      Some(ns) => {
        let (_, tier) = self.resolve(ns)?;
        tier.clear(ns)
      }
      None => {
        for name in self.namespaces.keys() {
          let (_, tier) = self.resolve(name)?;
          tier.clear(name)?;
        }
        Ok(())
      }
    }
  }

  pub fn stats(&self) -> CacheStats {
    let entries = self
      .namespaces
      .keys()
      .map(|name| {
        let len = self
          .resolve(name)
          .and_then(|(_, tier)| tier.len(name))
          .unwrap_or(0);
        (name.clone(), len)
      })
      .collect();

    CacheStats {
      hits: self.counters.hits.load(Ordering::Relaxed),
      misses: self.counters.misses.load(Ordering::Relaxed),
      writes: self.counters.writes.load(Ordering::Relaxed),
      write_failures: self.counters.write_failures.load(Ordering::Relaxed),
      evictions: self.counters.evictions.load(Ordering::Relaxed),
      expirations: self.counters.expirations.load(Ordering::Relaxed),
      entries,
    }
  }

  fn discard(&self, namespace: &str, tier: &Arc<dyn CacheTier>, key: &str) {
    if let Err(e) = tier.remove(namespace, key) {
      warn!(namespace, key, error = %e, "failed to purge cache entry");
    }
  }

  fn record_write(&self, namespace: &str, admission: Admission) {
    Counters::bump(&self.counters.writes, 1);
    Counters::bump(&self.counters.expirations, admission.purged as u64);
    Counters::bump(&self.counters.evictions, admission.evicted as u64);
    if admission.evicted > 0 {
      debug!(namespace, evicted = admission.evicted, "evicted oldest cache entries");
    }
  }

  /// Free space after a failed write: expired entries, or failing that the oldest
  /// quarter of the namespace.
  fn eviction_pass(&self, cfg: &NamespaceConfig, tier: &Arc<dyn CacheTier>) -> CacheResult<()> {
    let ns = cfg.namespace.as_str();
    let purged = tier.purge_expired(ns, self.clock.now_millis())?;
    Counters::bump(&self.counters.expirations, purged as u64);
    if purged == 0 {
      let len = tier.len(ns)?;
      let evicted = tier.evict_oldest(ns, (len / 4).max(1))?;
      Counters::bump(&self.counters.evictions, evicted as u64);
    }
    Ok(())
  }
}

impl std::fmt::Debug for TieredCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TieredCache")
      .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
      .finish()
  }
}
