//! Content hashing for change detection.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of the JSON serialization of `value`, as 64 lowercase hex chars.
///
/// Struct fields serialize in declaration order, so equal values always hash
/// equally.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&json);
    Ok(format!("{digest:x}"))
}
