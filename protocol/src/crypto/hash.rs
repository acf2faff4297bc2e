//! # Hashing Utilities
//!
//! Two hash functions, two jobs:
//!
//! - **SHA-256** derives ledger transaction IDs from `(nonce, creator)`.
//!   Ledger backends expect a SHA-256 hex ID, so that's what we produce.
//! - **BLAKE3** (in `derive_key` mode) computes the digests that parties
//!   actually sign: token requests, acknowledgements, audit approvals.
//!   Each use gets its own context string, so a signature over one can
//!   never be passed off as a signature over another.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of the input data.
///
/// # Example
///
/// ```
/// use tokenflow_protocol::crypto::sha256;
///
/// assert_eq!(sha256(b"tokenflow").len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over several parts fed in order, without concatenating them.
pub fn sha256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Domain-separated BLAKE3 digest.
///
/// Uses BLAKE3's `derive_key` mode: the context string selects a distinct
/// IV, so equal `data` under different contexts never collides.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Short hex fingerprint of some bytes, for log lines only.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(&blake3_hash(data)[..8])
}
