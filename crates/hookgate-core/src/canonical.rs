//! Canonical JSON (RFC 8785) and SHA-256 helpers.
//!
//! Every digest in the pipeline (approval payloads, audit chain links,
//! derived job ids, idempotency keys) is taken over the JCS encoding so
//! that key order and whitespace never change a hash.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// All-zero hash used as `prev_hash` of the first audit entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_jcs::to_vec(value)?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 over the canonical encoding of `value`, hex encoded.
pub fn digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

/// Hash a chain link: `H(prev_hash || body)`.
pub fn chain_hash(prev_hash: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}
