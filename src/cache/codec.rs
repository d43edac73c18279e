//! Payload encoding: serde_json plus optional zstd for large values.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::CacheResult;

/// Payloads at or below this size are stored uncompressed even when the namespace
/// asks for compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const ZSTD_LEVEL: i32 = 3;

/// Serialize `value`, compressing when allowed and worthwhile.
/// Returns the payload and whether it was compressed.
pub fn encode<T: Serialize + ?Sized>(value: &T, compress: bool) -> CacheResult<(Vec<u8>, bool)> {
  let raw = serde_json::to_vec(value)?;
  if compress && raw.len() > COMPRESSION_THRESHOLD {
    let packed = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?;
    Ok((packed, true))
  } else {
    Ok((raw, false))
  }
}

pub fn decode<T: DeserializeOwned>(payload: &[u8], compressed: bool) -> CacheResult<T> {
  if compressed {
    let raw = zstd::decode_all(payload)?;
    Ok(serde_json::from_slice(&raw)?)
  } else {
    Ok(serde_json::from_slice(payload)?)
  }
}
