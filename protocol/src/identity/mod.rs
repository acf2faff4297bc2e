//! # Identity Module
//!
//! Who is who in a token transaction.
//!
//! Every party has a long-term **endpoint identity** (the key other parties
//! open sessions to) and any number of **recipient identities**: fresh,
//! unlinkable keys handed out to counterparties so they can name the party
//! as the owner of a token output without revealing which endpoint it
//! belongs to.
//!
//! Both kinds are an [`Identity`]: the raw bytes of an Ed25519 public key.
//! Whoever holds the matching secret key can sign for it.
//!
//! ```text
//! Wallet "alice"
//!   ├── default keypair      ── endpoint identity (sessions, acks)
//!   └── recipient keypairs   ── token owners (one per incoming payment)
//! ```
//!
//! The wallet layer also produces the two metadata blobs that travel with a
//! recipient identity: **audit info** (lets the auditor attribute the
//! identity to an enrollment ID) and **token metadata** (opaque to the
//! protocol, attached to outputs).

pub mod wallet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::crypto::keys::{PublicKey, Signature};

pub use wallet::{AuditInfo, PartyLocation, RecipientData, Wallet, WalletRegistry, WalletService};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by identity and wallet operations.
#[derive(Debug, Error)]
pub enum WalletError {
    /// No wallet is registered under the given ID.
    #[error("wallet [{0}] not found")]
    WalletNotFound(String),

    /// The identity does not belong to any local wallet.
    #[error("identity [{0}] is not mine")]
    NotMine(Identity),

    /// Audit info or token metadata is unknown for the identity.
    #[error("no audit info for identity [{0}]")]
    MissingAuditInfo(Identity),

    /// The identity bytes are not a valid public key.
    #[error("malformed identity [{0}]")]
    MalformedIdentity(Identity),

    /// The recipient data failed to decode or is inconsistent.
    #[error("invalid recipient data: {0}")]
    InvalidRecipientData(String),
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// An opaque party identity: the bytes of an Ed25519 public key.
///
/// Ordered, hashable and cheap to clone, so it can key maps of signatures
/// and audit info. Serialized as hex in human-readable formats (JSON wire
/// messages) and as raw bytes in binary ones (bincode marshalling).
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(Vec<u8>);

impl Identity {
    /// Wrap raw identity bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The identity of a public key.
    pub fn from_public_key(pk: &PublicKey) -> Self {
        Self(pk.as_bytes().to_vec())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `true` for the empty identity (no owner, e.g. a redeemed output).
    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the identity as a public key.
    pub fn public_key(&self) -> Result<PublicKey, WalletError> {
        PublicKey::try_from_slice(&self.0).map_err(|_| WalletError::MalformedIdentity(self.clone()))
    }

    /// Verify `signature` over `message` as this identity. Malformed
    /// identities never verify.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        match self.public_key() {
            Ok(pk) => pk.verify(message, signature),
            Err(_) => false,
        }
    }

    /// Full hex form, used as a stable map key in logs and stores.
    pub fn unique_id(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<none>");
        }
        let b58 = bs58::encode(&self.0).into_string();
        write!(f, "{}", &b58[..b58.len().min(12)])
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self)
    }
}

impl From<&PublicKey> for Identity {
    fn from(pk: &PublicKey) -> Self {
        Self::from_public_key(pk)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&hex::encode(&self.0))
        } else {
            s.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            hex::decode(s)
                .map(Identity)
                .map_err(serde::de::Error::custom)
        } else {
            Ok(Identity(Vec::<u8>::deserialize(d)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::PartyKeypair;

    #[test]
    fn identity_verifies_own_signature() {
        let kp = PartyKeypair::generate();
        let id = Identity::from_public_key(&kp.public_key());
        let sig = kp.sign(b"digest");
        assert!(id.verify(b"digest", &sig));
        assert!(!id.verify(b"other", &sig));
    }

    #[test]
    fn malformed_identity_never_verifies() {
        let kp = PartyKeypair::generate();
        let id = Identity::from_bytes(vec![1, 2, 3]);
        assert!(!id.verify(b"digest", &kp.sign(b"digest")));
        assert!(matches!(id.public_key(), Err(WalletError::MalformedIdentity(_))));
    }

    #[test]
    fn json_uses_hex_and_bincode_uses_bytes() {
        let id = Identity::from_bytes(vec![0xAB, 0xCD]);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abcd\"");
        let back: Identity = serde_json::from_str("\"abcd\"").unwrap();
        assert_eq!(back, id);

        let raw = bincode::serialize(&id).unwrap();
        let back: Identity = bincode::deserialize(&raw).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn empty_identity_displays_none() {
        assert!(Identity::default().is_none());
        assert_eq!(Identity::default().to_string(), "<none>");
    }
}
