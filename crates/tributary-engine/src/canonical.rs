//! Canonical JSON hashing.
//!
//! Hashes are SHA-256 over the RFC 8785 (JCS) serialization of a JSON value,
//! so logically identical values hash identically across processes
//! regardless of map ordering or number formatting.

use serde::Serialize;
use sha2::{Digest, Sha256};

use tributary_types::{Result, TributaryError};

/// Stable hex digest of a JSON value.
pub fn stable_hash(value: &serde_json::Value) -> Result<String> {
    let canonical = serde_jcs::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Serialize `value` to JSON and hash it.
///
/// `serde_json` silently turns NaN and infinities into `null`; callers that
/// hash structures containing `f64` must route those fields through
/// [`finite_f64`] first.
pub fn stable_hash_of<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)?;
    stable_hash(&json)
}

/// Reject NaN and infinities instead of letting them normalize to `null`.
pub fn finite_f64(context: &str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TributaryError::NonFiniteValue {
            context: context.to_string(),
            value,
        })
    }
}

/// First `len` characters of a hex digest, for operator-facing messages.
pub fn hash_prefix(hash: &str, len: usize) -> &str {
    match hash.char_indices().nth(len) {
        Some((idx, _)) => &hash[..idx],
        None => hash,
    }
}
