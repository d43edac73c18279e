//! Canonical request keys shared by the cache, batcher, debouncer and prefetcher.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::form_urlencoded;

/// A scalar request parameter.
///
/// Serializes untagged so a `Params` map becomes a flat JSON object on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
}

impl Scalar {
  /// Type-tagged encoding used in canonical keys, so `1` and `"1"` never collide.
  fn tagged(&self) -> String {
    match self {
      Self::Null => "n:".to_string(),
      Self::Bool(b) => format!("b:{}", b),
      Self::Int(i) => format!("i:{}", i),
      Self::Float(f) => format!("f:{}", f),
      Self::Str(s) => format!("s:{}", s),
    }
  }

  /// Plain rendering for URL query strings.
  pub fn as_query_value(&self) -> String {
    match self {
      Self::Null => String::new(),
      Self::Bool(b) => b.to_string(),
      Self::Int(i) => i.to_string(),
      Self::Float(f) => f.to_string(),
      Self::Str(s) => s.clone(),
    }
  }

  /// Parse a command-line style value: integers, floats, booleans and `null` are
  /// recognised, everything else is a string.
  pub fn parse_loose(raw: &str) -> Self {
    if raw == "null" {
      Self::Null
    } else if let Ok(b) = raw.parse::<bool>() {
      Self::Bool(b)
    } else if let Ok(i) = raw.parse::<i64>() {
      Self::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
      Self::Float(f)
    } else {
      Self::Str(raw.to_string())
    }
  }
}

impl From<&str> for Scalar {
  fn from(s: &str) -> Self {
    Self::Str(s.to_string())
  }
}

impl From<String> for Scalar {
  fn from(s: String) -> Self {
    Self::Str(s)
  }
}

impl From<i64> for Scalar {
  fn from(i: i64) -> Self {
    Self::Int(i)
  }
}

impl From<i32> for Scalar {
  fn from(i: i32) -> Self {
    Self::Int(i64::from(i))
  }
}

impl From<bool> for Scalar {
  fn from(b: bool) -> Self {
    Self::Bool(b)
  }
}

impl From<f64> for Scalar {
  fn from(f: f64) -> Self {
    Self::Float(f)
  }
}

/// Request parameters. A `BTreeMap` keeps keys sorted, so equal parameter sets
/// always encode identically regardless of insertion order.
pub type Params = BTreeMap<String, Scalar>;

/// Build a `Params` map from `(name, value)` pairs.
pub fn params<I, K, V>(pairs: I) -> Params
where
  I: IntoIterator<Item = (K, V)>,
  K: Into<String>,
  V: Into<Scalar>,
{
  pairs
    .into_iter()
    .map(|(k, v)| (k.into(), v.into()))
    .collect()
}

/// Canonical identity of a logical request: endpoint plus sorted, type-tagged params.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  canonical: String,
}

impl RequestKey {
  pub fn new(endpoint: &str, params: &Params) -> Self {
    Self {
      canonical: encode(endpoint, params.iter()),
    }
  }

  /// Key over only the named parameters. Used to group requests into one batch.
  pub fn grouped(endpoint: &str, params: &Params, group_by: &[String]) -> Self {
    Self {
      canonical: encode(
        endpoint,
        params.iter().filter(|(k, _)| group_by.contains(k)),
      ),
    }
  }

  pub fn canonical(&self) -> &str {
    &self.canonical
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

fn encode<'a>(endpoint: &str, params: impl Iterator<Item = (&'a String, &'a Scalar)>) -> String {
  let mut query = form_urlencoded::Serializer::new(String::new());
  for (name, value) in params {
    query.append_pair(name, &value.tagged());
  }
  let query = query.finish();
  if query.is_empty() {
    endpoint.to_string()
  } else {
    format!("{}?{}", endpoint, query)
  }
}
