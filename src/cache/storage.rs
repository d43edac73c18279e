//! Cache tier implementations: in-memory map and SQLite (file-backed or session-scoped).

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{Admission, CacheTier, StoredEntry};
use crate::error::{CacheError, CacheResult};

// ============================================================================
// Memory tier
// ============================================================================

/// One namespace's entries plus an index ordered by creation time.
#[derive(Debug, Default)]
struct NamespaceMap {
  entries: HashMap<String, (u64, StoredEntry)>,
  /// (created_at, insertion sequence, key) so equal timestamps stay FIFO
  by_age: BTreeSet<(i64, u64, String)>,
  bytes: usize,
}

impl NamespaceMap {
  fn insert(&mut self, seq: u64, entry: StoredEntry) {
    self.remove(&entry.key);
    self.bytes += entry.payload.len();
    self
      .by_age
      .insert((entry.created_at, seq, entry.key.clone()));
    self.entries.insert(entry.key.clone(), (seq, entry));
  }

  fn remove(&mut self, key: &str) -> Option<StoredEntry> {
    let (seq, entry) = self.entries.remove(key)?;
    self.bytes -= entry.payload.len();
    self.by_age.remove(&(entry.created_at, seq, entry.key.clone()));
    Some(entry)
  }

  fn purge_expired(&mut self, now: i64) -> usize {
    let expired: Vec<String> = self
      .entries
      .values()
      .filter(|(_, e)| e.is_expired(now))
      .map(|(_, e)| e.key.clone())
      .collect();
    for key in &expired {
      self.remove(key);
    }
    expired.len()
  }

  fn evict_oldest(&mut self, count: usize) -> usize {
    let mut evicted = 0;
    while evicted < count {
      let Some((_, _, key)) = self.by_age.iter().next().cloned() else {
        break;
      };
      self.remove(&key);
      evicted += 1;
    }
    evicted
  }
}

#[derive(Debug, Default)]
struct MemoryState {
  namespaces: HashMap<String, NamespaceMap>,
  next_seq: u64,
}

impl MemoryState {
  fn take_seq(&mut self) -> u64 {
    let seq = self.next_seq;
    self.next_seq += 1;
    seq
  }
}

/// Hash-map tier with an ordered age index for O(log n) oldest-entry eviction.
#[derive(Debug, Default)]
pub struct MemoryTier {
  state: Mutex<MemoryState>,
  /// Optional payload byte budget per namespace
  max_bytes: Option<usize>,
}

impl MemoryTier {
  pub fn new() -> Self {
    Self::default()
  }

  /// Refuse writes that would push a namespace past `max_bytes` of payload.
  pub fn with_byte_quota(max_bytes: usize) -> Self {
    Self {
      state: Mutex::default(),
      max_bytes: Some(max_bytes),
    }
  }

  fn lock(&self) -> CacheResult<std::sync::MutexGuard<'_, MemoryState>> {
    self.state.lock().map_err(|_| CacheError::LockPoisoned)
  }

  fn check_quota(&self, namespace: &str, ns: &NamespaceMap, entry: &StoredEntry) -> CacheResult<()> {
    let Some(max_bytes) = self.max_bytes else {
      return Ok(());
    };
    let replaced = ns
      .entries
      .get(&entry.key)
      .map(|(_, e)| e.payload.len())
      .unwrap_or(0);
    if ns.bytes - replaced + entry.payload.len() > max_bytes {
      return Err(CacheError::QuotaExceeded {
        namespace: namespace.to_string(),
      });
    }
    Ok(())
  }
}

impl CacheTier for MemoryTier {
  fn read(&self, namespace: &str, key: &str) -> CacheResult<Option<StoredEntry>> {
    let state = self.lock()?;
    Ok(
      state
        .namespaces
        .get(namespace)
        .and_then(|ns| ns.entries.get(key))
        .map(|(_, entry)| entry.clone()),
    )
  }

  fn write(&self, namespace: &str, entry: StoredEntry) -> CacheResult<()> {
    let mut state = self.lock()?;
    let seq = state.take_seq();
    let ns = state.namespaces.entry(namespace.to_string()).or_default();
    self.check_quota(namespace, ns, &entry)?;
    ns.insert(seq, entry);
    Ok(())
  }

  fn write_bounded(
    &self,
    namespace: &str,
    entry: StoredEntry,
    max_entries: usize,
    now: i64,
  ) -> CacheResult<Admission> {
    let mut state = self.lock()?;
    let seq = state.take_seq();
    let ns = state.namespaces.entry(namespace.to_string()).or_default();

    let mut admission = Admission::default();
    if !ns.entries.contains_key(&entry.key) && ns.entries.len() >= max_entries {
      admission.purged = ns.purge_expired(now);
      let len = ns.entries.len();
      if len >= max_entries {
        admission.evicted = ns.evict_oldest(len + 1 - max_entries);
      }
    }

    self.check_quota(namespace, ns, &entry)?;
    ns.insert(seq, entry);
    Ok(admission)
  }

  fn remove(&self, namespace: &str, key: &str) -> CacheResult<bool> {
    let mut state = self.lock()?;
    Ok(
      state
        .namespaces
        .get_mut(namespace)
        .and_then(|ns| ns.remove(key))
        .is_some(),
    )
  }

  fn clear(&self, namespace: &str) -> CacheResult<()> {
    self.lock()?.namespaces.remove(namespace);
    Ok(())
  }

  fn len(&self, namespace: &str) -> CacheResult<usize> {
    Ok(
      self
        .lock()?
        .namespaces
        .get(namespace)
        .map(|ns| ns.entries.len())
        .unwrap_or(0),
    )
  }

  fn purge_expired(&self, namespace: &str, now: i64) -> CacheResult<usize> {
    let mut state = self.lock()?;
    Ok(
      state
        .namespaces
        .get_mut(namespace)
        .map(|ns| ns.purge_expired(now))
        .unwrap_or(0),
    )
  }

  fn evict_oldest(&self, namespace: &str, count: usize) -> CacheResult<usize> {
    let mut state = self.lock()?;
    Ok(
      state
        .namespaces
        .get_mut(namespace)
        .map(|ns| ns.evict_oldest(count))
        .unwrap_or(0),
    )
  }
}

// ============================================================================
// SQLite tier
// ============================================================================

/// SQLite-backed tier. A file database for persistent namespaces, an in-memory
/// database for session namespaces.
pub struct SqliteTier {
  conn: Mutex<Connection>,
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    ttl_millis INTEGER NOT NULL,
    PRIMARY KEY (namespace, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(namespace, created_at);
"#;

impl SqliteTier {
  /// Open (or create) a cache database at `path`.
  pub fn open(path: &Path) -> CacheResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    Self::from_connection(Connection::open(path)?)
  }

  /// Session-scoped store: lives exactly as long as this value.
  pub fn in_memory() -> CacheResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Default location of the persistent cache database.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("leavedesk").join("cache.db"))
  }

  fn from_connection(conn: Connection) -> CacheResult<Self> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> CacheResult<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| CacheError::LockPoisoned)
  }
}

/// SQLite integers are signed; TTLs beyond `i64::MAX` are stored as `i64::MAX`.
fn ttl_to_sql(ttl_millis: u64) -> i64 {
  i64::try_from(ttl_millis).unwrap_or(i64::MAX)
}

/// Map SQLite "disk full" style failures onto the quota error the cache reacts to.
fn map_write_error(namespace: &str, err: rusqlite::Error) -> CacheError {
  match err.sqlite_error_code() {
    Some(ErrorCode::DiskFull) | Some(ErrorCode::TooBig) => CacheError::QuotaExceeded {
      namespace: namespace.to_string(),
    },
    _ => CacheError::Storage(err),
  }
}

fn insert_entry(conn: &Connection, namespace: &str, entry: &StoredEntry) -> CacheResult<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (namespace, entry_key, payload, compressed, created_at, ttl_millis)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        entry.key,
        entry.payload,
        entry.compressed,
        entry.created_at,
        ttl_to_sql(entry.ttl_millis)
      ],
    )
    .map_err(|e| map_write_error(namespace, e))?;
  Ok(())
}

fn count_entries(conn: &Connection, namespace: &str) -> CacheResult<usize> {
  let count: i64 = conn.query_row(
    "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
    params![namespace],
    |row| row.get(0),
  )?;
  Ok(count as usize)
}

fn delete_expired(conn: &Connection, namespace: &str, now: i64) -> CacheResult<usize> {
  let removed = conn.execute(
    "DELETE FROM cache_entries WHERE namespace = ? AND ? - created_at >= ttl_millis",
    params![namespace, now],
  )?;
  Ok(removed)
}

fn delete_oldest(conn: &Connection, namespace: &str, count: usize) -> CacheResult<usize> {
  let removed = conn.execute(
    "DELETE FROM cache_entries WHERE rowid IN (
       SELECT rowid FROM cache_entries WHERE namespace = ?
       ORDER BY created_at, rowid LIMIT ?
     )",
    params![namespace, count as i64],
  )?;
  Ok(removed)
}

impl CacheTier for SqliteTier {
  fn read(&self, namespace: &str, key: &str) -> CacheResult<Option<StoredEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare_cached(
      "SELECT payload, compressed, created_at, ttl_millis FROM cache_entries
       WHERE namespace = ? AND entry_key = ?",
    )?;

    let entry = stmt
      .query_row(params![namespace, key], |row| {
        Ok(StoredEntry {
          key: key.to_string(),
          payload: row.get(0)?,
          compressed: row.get(1)?,
          created_at: row.get(2)?,
          ttl_millis: u64::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
        })
      })
      .optional()?;

    Ok(entry)
  }

  fn write(&self, namespace: &str, entry: StoredEntry) -> CacheResult<()> {
    let conn = self.lock()?;
    insert_entry(&conn, namespace, &entry)
  }

  fn write_bounded(
    &self,
    namespace: &str,
    entry: StoredEntry,
    max_entries: usize,
    now: i64,
  ) -> CacheResult<Admission> {
    let mut conn = self.lock()?;
    // IMMEDIATE: hold the database write lock from the count through the insert
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let exists: bool = tx.query_row(
      "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE namespace = ? AND entry_key = ?)",
      params![namespace, entry.key],
      |row| row.get(0),
    )?;

    let mut admission = Admission::default();
    if !exists {
      let mut len = count_entries(&tx, namespace)?;
      if len >= max_entries {
        admission.purged = delete_expired(&tx, namespace, now)?;
        len = len.saturating_sub(admission.purged);
        if len >= max_entries {
          admission.evicted = delete_oldest(&tx, namespace, len + 1 - max_entries)?;
        }
      }
    }

    insert_entry(&tx, namespace, &entry)?;
    tx.commit()?;
    Ok(admission)
  }

  fn remove(&self, namespace: &str, key: &str) -> CacheResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE namespace = ? AND entry_key = ?",
      params![namespace, key],
    )?;
    Ok(removed > 0)
  }

  fn clear(&self, namespace: &str) -> CacheResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )?;
    Ok(())
  }

  fn len(&self, namespace: &str) -> CacheResult<usize> {
    let conn = self.lock()?;
    count_entries(&conn, namespace)
  }

  fn purge_expired(&self, namespace: &str, now: i64) -> CacheResult<usize> {
    let conn = self.lock()?;
    delete_expired(&conn, namespace, now)
  }

  fn evict_oldest(&self, namespace: &str, count: usize) -> CacheResult<usize> {
    let conn = self.lock()?;
    delete_oldest(&conn, namespace, count)
  }
}
