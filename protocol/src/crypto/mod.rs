//! # Cryptographic Primitives
//!
//! Thin, type-safe wrappers around audited implementations:
//!
//! - **Ed25519** (`ed25519-dalek`) for every signature in the protocol.
//! - **SHA-256** for ledger transaction IDs.
//! - **BLAKE3** for domain-separated signing digests.
//!
//! Nothing here is clever on purpose.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, domain_separated_hash, sha256};
pub use keys::{KeyError, PartyKeypair, PublicKey, Signature};
