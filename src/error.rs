//! Error types for the request pipeline and the cache.

use thiserror::Error;

/// Failure of a request as seen by a caller.
///
/// `Clone` so one settled result can be handed to every coalesced or debounced waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
  /// Transport-level failure of an individual upstream call.
  #[error("request to {endpoint} failed: {message}")]
  Network { endpoint: String, message: String },

  /// The backend answered with a non-success status.
  #[error("{endpoint} returned HTTP {status}")]
  Status { endpoint: String, status: u16 },

  /// The coalesced upstream call failed or its response could not be demultiplexed.
  #[error("batched request to {endpoint} failed: {message}")]
  BatchExecution { endpoint: String, message: String },

  /// The retry budget was spent. Carries the last underlying error.
  #[error("giving up after {attempts} attempts: {last}")]
  RetryExhausted {
    attempts: u32,
    last: Box<RequestError>,
  },

  /// The response did not match the type the caller asked for.
  #[error("could not decode response from {endpoint}: {message}")]
  Decode { endpoint: String, message: String },

  /// The pending call was cancelled before it settled.
  #[error("request was cancelled before it completed")]
  Cancelled,
}

impl RequestError {
  pub fn network(endpoint: &str, err: impl std::fmt::Display) -> Self {
    Self::Network {
      endpoint: endpoint.to_string(),
      message: err.to_string(),
    }
  }

  pub fn batch(endpoint: &str, err: impl std::fmt::Display) -> Self {
    Self::BatchExecution {
      endpoint: endpoint.to_string(),
      message: err.to_string(),
    }
  }
}

/// Failure inside the cache layer. Never escapes `RequestCoordinator::request`.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("no cache namespace named {0:?}")]
  UnknownNamespace(String),

  /// Entry exists but cannot be decoded.
  #[error("cache entry {namespace}/{key} is unreadable: {message}")]
  Read {
    namespace: String,
    key: String,
    message: String,
  },

  /// Write still failed after an eviction pass and one retry.
  #[error("cache write {namespace}/{key} dropped: {source}")]
  Write {
    namespace: String,
    key: String,
    #[source]
    source: Box<CacheError>,
  },

  /// The tier refused the write for lack of space.
  #[error("cache tier for {namespace} is over quota")]
  QuotaExceeded { namespace: String },

  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("compression error: {0}")]
  Compression(#[from] std::io::Error),

  #[error("cache lock poisoned")]
  LockPoisoned,
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
