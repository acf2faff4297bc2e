//! # Ledger Module
//!
//! The boundary between the transaction protocol and whatever ledger
//! actually orders and validates transactions. The protocol only needs a
//! handful of things from it:
//!
//! ```text
//! request_approval ── endorse a read/write set, get an Envelope back
//! broadcast        ── submit the Envelope for ordering
//! get_status       ── Unknown | Pending | Confirmed | Deleted
//! finality events  ── FinalityListener::on_status, once per terminal status
//! store_envelope / get_rwset ── keep a private copy of an envelope
//! ```
//!
//! A ledger is addressed by its `(network, channel)` pair through the
//! [`Networks`] provider. The only implementation shipped here is
//! [`MemoryLedger`], an in-process ledger backed by a [`TokenVault`].
//!
//! [`TokenVault`]: crate::vault::TokenVault

pub mod memory;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::keys::{PublicKey, Signature};
use crate::identity::Identity;
use crate::storage::TxStatus;
use crate::vault::{TokenId, UnspentToken};

pub use memory::MemoryLedger;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by ledger backends.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No ledger is registered for the network/channel pair.
    #[error("network [{network}:{channel}] does not exist")]
    UnknownNetwork {
        /// Network name.
        network: String,
        /// Channel name.
        channel: String,
    },

    /// The envelope is malformed or its endorsement does not verify.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The ledger refused to endorse the read/write set.
    #[error("approval rejected for [{tx_id}]: {reason}")]
    Rejected {
        /// Transaction that was refused.
        tx_id: String,
        /// Why.
        reason: String,
    },

    /// Encoding or decoding failed.
    #[error("ledger serialization error: {0}")]
    Serialization(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// ---------------------------------------------------------------------------
// Read/write sets and envelopes
// ---------------------------------------------------------------------------

/// Ledger state touched by a transaction: tokens it spends and tokens it
/// creates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RwSet {
    /// Tokens consumed.
    pub reads: Vec<TokenId>,
    /// Tokens produced.
    pub writes: Vec<UnspentToken>,
}

/// Ledger-ready, endorsed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Ledger transaction ID.
    pub tx_id: String,
    pub network: String,
    pub channel: String,
    pub namespace: String,
    /// Party that asked for approval.
    pub creator: Identity,
    pub rwset: RwSet,
    /// Digest of the token request the read/write set was derived from.
    pub request_digest: Vec<u8>,
    /// Identity of the endorsing peer.
    pub endorser: Identity,
    /// Endorser's signature over [`Envelope::signing_bytes`].
    pub endorsement: Vec<u8>,
}

impl Envelope {
    /// Canonical bytes covered by the endorsement.
    pub fn signing_bytes(&self) -> LedgerResult<Vec<u8>> {
        let body = (
            &self.tx_id,
            &self.network,
            &self.channel,
            &self.namespace,
            &self.creator,
            &self.rwset,
            &self.request_digest,
        );
        bincode::serialize(&body).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    /// Check the endorsement against the endorser identity.
    pub fn verify(&self) -> LedgerResult<()> {
        let pk = PublicKey::try_from_slice(self.endorser.as_bytes())
            .map_err(|e| LedgerError::InvalidEnvelope(e.to_string()))?;
        let sig = Signature::from_vec(self.endorsement.clone());
        if !pk.verify(&self.signing_bytes()?, &sig) {
            return Err(LedgerError::InvalidEnvelope(format!(
                "endorsement of [{}] does not verify",
                self.tx_id
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> LedgerResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    pub fn from_bytes(raw: &[u8]) -> LedgerResult<Self> {
        bincode::deserialize(raw).map_err(|e| LedgerError::Serialization(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Receives the terminal status of a transaction from the ledger.
pub trait FinalityListener: Send + Sync {
    fn on_status(&self, tx_id: &str, status: TxStatus, message: &str);
}

/// What the protocol consumes from a ledger backend.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Network name.
    fn network(&self) -> &str;

    /// Channel name.
    fn channel(&self) -> &str;

    /// Endorse a read/write set and return the signed envelope.
    async fn request_approval(
        &self,
        namespace: &str,
        tx_id: &str,
        creator: &Identity,
        rwset: RwSet,
        request_digest: Vec<u8>,
    ) -> LedgerResult<Envelope>;

    /// Submit an envelope for ordering. Finality is reported later through
    /// listeners and [`Ledger::get_status`].
    async fn broadcast(&self, envelope: &Envelope) -> LedgerResult<()>;

    /// Read/write set of a broadcast or locally stored envelope.
    fn get_rwset(&self, tx_id: &str) -> LedgerResult<Option<RwSet>>;

    /// Keep a private copy of a serialized envelope.
    fn store_envelope(&self, tx_id: &str, raw: &[u8]) -> LedgerResult<()>;

    /// Current status as seen by the ledger.
    fn get_status(&self, tx_id: &str) -> LedgerResult<(TxStatus, String)>;

    /// Notify `listener` once `tx_id` reaches a terminal status. If it
    /// already has one, the listener fires immediately.
    fn add_finality_listener(&self, tx_id: &str, listener: Arc<dyn FinalityListener>);

    /// Undo [`Ledger::add_finality_listener`] (matched by pointer).
    fn remove_finality_listener(&self, tx_id: &str, listener: &Arc<dyn FinalityListener>);
}

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

/// Ledger lookup by `(network, channel)`.
#[derive(Default)]
pub struct Networks {
    ledgers: DashMap<(String, String), Arc<dyn Ledger>>,
}

impl Networks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ledger under its own network/channel names.
    pub fn register(&self, ledger: Arc<dyn Ledger>) {
        let key = (ledger.network().to_string(), ledger.channel().to_string());
        self.ledgers.insert(key, ledger);
    }

    /// The ledger serving `network`/`channel`.
    pub fn get(&self, network: &str, channel: &str) -> LedgerResult<Arc<dyn Ledger>> {
        self.ledgers
            .get(&(network.to_string(), channel.to_string()))
            .map(|l| l.value().clone())
            .ok_or_else(|| LedgerError::UnknownNetwork {
                network: network.to_string(),
                channel: channel.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::PartyKeypair;

    fn signed_envelope(kp: &PartyKeypair) -> Envelope {
        let mut env = Envelope {
            tx_id: "tx1".into(),
            network: "net".into(),
            channel: "ch".into(),
            namespace: "token".into(),
            creator: Identity::from_bytes(vec![1]),
            rwset: RwSet::default(),
            request_digest: vec![9; 32],
            endorser: Identity::from_public_key(&kp.public_key()),
            endorsement: vec![],
        };
        env.endorsement = kp.sign(&env.signing_bytes().unwrap()).into_vec();
        env
    }

    #[test]
    fn envelope_endorsement_verifies() {
        let kp = PartyKeypair::generate();
        let env = signed_envelope(&kp);
        env.verify().unwrap();

        let decoded = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let kp = PartyKeypair::generate();
        let mut env = signed_envelope(&kp);
        env.tx_id = "tx2".into();
        assert!(matches!(env.verify(), Err(LedgerError::InvalidEnvelope(_))));
    }

    #[test]
    fn unknown_network_is_an_error() {
        let networks = Networks::new();
        assert!(matches!(
            networks.get("net", "ch"),
            Err(LedgerError::UnknownNetwork { .. })
        ));
    }
}
