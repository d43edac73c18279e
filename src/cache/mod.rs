//! Namespaced, tiered response cache.
//!
//! - Each namespace picks a tier (memory, persistent SQLite, session SQLite)
//! - Entries carry their own TTL and are purged lazily on read
//! - Namespaces are capacity-bounded; expired entries go first, then the oldest
//! - Large payloads can be zstd-compressed per namespace

mod codec;
mod layer;
mod storage;
mod traits;

pub use codec::COMPRESSION_THRESHOLD;
pub use layer::{CacheStats, TieredCache};
pub use storage::{MemoryTier, SqliteTier};
pub use traits::{Admission, CacheTier, NamespaceConfig, StoredEntry, TierKind};
