//! # Wallets
//!
//! A [`Wallet`] owns one default keypair and a growing set of recipient
//! keypairs. The [`WalletRegistry`] is the per-party collection of wallets
//! plus everything the party has learned about remote recipients; it is the
//! in-process implementation of [`WalletService`].
//!
//! The registry is also where the protocol decides whether a counterparty is
//! local or remote ([`PartyLocation`]). That decision is made once per
//! identity, by membership lookup, and every protocol step branches on the
//! resulting enum.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{Identity, WalletError};
use crate::crypto::keys::PartyKeypair;

// ---------------------------------------------------------------------------
// Wire Types
// ---------------------------------------------------------------------------

/// A recipient identity together with the blobs that must travel with it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecipientData {
    /// The (possibly pseudonymous) identity that will own the output.
    pub identity: Identity,
    /// Lets the auditor map the identity to an enrollment ID.
    pub audit_info: Vec<u8>,
    /// Opaque metadata attached to outputs owned by the identity.
    pub token_metadata: Vec<u8>,
}

/// Decoded audit info.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    /// Enrollment ID of the wallet behind the identity.
    pub enrollment_id: String,
    /// The identity this audit info describes.
    pub identity: Identity,
}

impl AuditInfo {
    /// Decode from the JSON blob carried in [`RecipientData::audit_info`].
    pub fn from_bytes(raw: &[u8]) -> Result<Self, WalletError> {
        serde_json::from_slice(raw).map_err(|e| WalletError::InvalidRecipientData(e.to_string()))
    }

    fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of strings and bytes cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct OwnerMetadata<'a> {
    scheme: &'static str,
    owner: &'a Identity,
}

fn token_metadata_for(id: &Identity) -> Vec<u8> {
    serde_json::to_vec(&OwnerMetadata {
        scheme: "ed25519",
        owner: id,
    })
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// WalletService
// ---------------------------------------------------------------------------

/// What the protocol needs from the wallet subsystem.
pub trait WalletService: Send + Sync {
    /// A recipient identity from the given wallet (or the default one),
    /// bundled with its audit info and token metadata.
    fn recipient_identity(&self, wallet_id: Option<&str>) -> Result<RecipientData, WalletError>;

    /// Audit info of a local or previously registered identity.
    fn audit_info(&self, id: &Identity) -> Result<Vec<u8>, WalletError>;

    /// Token metadata of a local or previously registered identity.
    fn token_metadata(&self, id: &Identity) -> Result<Vec<u8>, WalletError>;

    /// Remember a remote recipient so its audit info can be attached to
    /// outputs it owns.
    fn register_recipient_identity(&self, data: &RecipientData) -> Result<(), WalletError>;

    /// `true` if a local wallet holds the secret key of `id`.
    fn is_me(&self, id: &Identity) -> bool;

    /// The keypair that signs as `id`.
    fn signer(&self, id: &Identity) -> Result<PartyKeypair, WalletError>;
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// A named wallet: one default keypair and any number of recipient ones.
#[derive(Debug)]
pub struct Wallet {
    id: String,
    default: PartyKeypair,
    recipients: RwLock<HashMap<Identity, PartyKeypair>>,
}

impl Wallet {
    /// Creates a wallet with a freshly generated default key.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_keypair(id, PartyKeypair::generate())
    }

    /// Creates a wallet around an existing default key.
    pub fn with_keypair(id: impl Into<String>, default: PartyKeypair) -> Self {
        Self {
            id: id.into(),
            default,
            recipients: RwLock::new(HashMap::new()),
        }
    }

    /// Wallet ID, also used as the enrollment ID in audit info.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The default (non-anonymous) identity.
    pub fn identity(&self) -> Identity {
        Identity::from_public_key(&self.default.public_key())
    }

    /// Generates and remembers a fresh recipient identity.
    pub fn new_recipient_identity(&self) -> Identity {
        let kp = PartyKeypair::generate();
        let id = Identity::from_public_key(&kp.public_key());
        self.recipients.write().insert(id.clone(), kp);
        debug!(wallet = %self.id, identity = %id, "new recipient identity");
        id
    }

    /// Recipient data for a fresh pseudonymous identity.
    pub fn recipient_data(&self) -> RecipientData {
        let identity = self.new_recipient_identity();
        self.recipient_data_for(&identity)
    }

    /// Recipient data for the default identity.
    pub fn default_recipient_data(&self) -> RecipientData {
        self.recipient_data_for(&self.identity())
    }

    fn recipient_data_for(&self, identity: &Identity) -> RecipientData {
        RecipientData {
            identity: identity.clone(),
            audit_info: self.audit_info_unchecked(identity),
            token_metadata: token_metadata_for(identity),
        }
    }

    fn audit_info_unchecked(&self, identity: &Identity) -> Vec<u8> {
        AuditInfo {
            enrollment_id: self.id.clone(),
            identity: identity.clone(),
        }
        .to_bytes()
    }

    /// `true` if the identity is the default one or one of the recipients.
    pub fn contains(&self, id: &Identity) -> bool {
        *id == self.identity() || self.recipients.read().contains_key(id)
    }

    /// Keypair for an identity this wallet holds.
    pub fn signer(&self, id: &Identity) -> Option<PartyKeypair> {
        if *id == self.identity() {
            return Some(self.default.clone());
        }
        self.recipients.read().get(id).cloned()
    }

    /// Every identity this wallet can sign for, default first.
    pub fn identities(&self) -> Vec<Identity> {
        let mut out = vec![self.identity()];
        out.extend(self.recipients.read().keys().cloned());
        out
    }
}

// ---------------------------------------------------------------------------
// Party location
// ---------------------------------------------------------------------------

/// Whether a counterparty is served by this process or must be reached
/// over a session.
#[derive(Debug, Clone)]
pub enum PartyLocation {
    /// A local wallet holds the identity.
    Local(Arc<Wallet>),
    /// Nobody here holds the identity.
    Remote,
}

impl PartyLocation {
    /// `true` for [`PartyLocation::Local`].
    pub fn is_local(&self) -> bool {
        matches!(self, PartyLocation::Local(_))
    }
}

// ---------------------------------------------------------------------------
// WalletRegistry
// ---------------------------------------------------------------------------

/// All wallets of one party, plus what the party knows about remote
/// recipients.
#[derive(Debug, Default)]
pub struct WalletRegistry {
    wallets: DashMap<String, Arc<Wallet>>,
    default_wallet: RwLock<Option<String>>,
    remote: DashMap<Identity, RecipientData>,
}

impl WalletRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wallet. The first wallet added becomes the default.
    pub fn add_wallet(&self, wallet: Wallet) -> Arc<Wallet> {
        let wallet = Arc::new(wallet);
        let mut default = self.default_wallet.write();
        if default.is_none() {
            *default = Some(wallet.id().to_string());
        }
        self.wallets.insert(wallet.id().to_string(), Arc::clone(&wallet));
        wallet
    }

    /// Creates and registers a wallet with a fresh key.
    pub fn create_wallet(&self, id: &str) -> Arc<Wallet> {
        self.add_wallet(Wallet::new(id))
    }

    /// Looks a wallet up by ID.
    pub fn wallet(&self, id: &str) -> Result<Arc<Wallet>, WalletError> {
        self.wallets
            .get(id)
            .map(|w| Arc::clone(w.value()))
            .ok_or_else(|| WalletError::WalletNotFound(id.to_string()))
    }

    /// The default wallet.
    pub fn default_wallet(&self) -> Result<Arc<Wallet>, WalletError> {
        let id = self
            .default_wallet
            .read()
            .clone()
            .ok_or_else(|| WalletError::WalletNotFound("<default>".to_string()))?;
        self.wallet(&id)
    }

    /// The wallet `id`, or the default one when `id` is empty.
    pub fn wallet_or_default(&self, id: &str) -> Result<Arc<Wallet>, WalletError> {
        if id.is_empty() {
            self.default_wallet()
        } else {
            self.wallet(id)
        }
    }

    /// The local wallet holding `id`, if any.
    pub fn wallet_by_identity(&self, id: &Identity) -> Option<Arc<Wallet>> {
        self.wallets
            .iter()
            .find(|w| w.value().contains(id))
            .map(|w| Arc::clone(w.value()))
    }

    /// Resolves an identity to a local wallet or marks it remote.
    pub fn locate(&self, id: &Identity) -> PartyLocation {
        match self.wallet_by_identity(id) {
            Some(w) => PartyLocation::Local(w),
            None => PartyLocation::Remote,
        }
    }
}

impl WalletService for WalletRegistry {
    fn recipient_identity(&self, wallet_id: Option<&str>) -> Result<RecipientData, WalletError> {
        let wallet = self.wallet_or_default(wallet_id.unwrap_or_default())?;
        Ok(wallet.recipient_data())
    }

    fn audit_info(&self, id: &Identity) -> Result<Vec<u8>, WalletError> {
        if let Some(w) = self.wallet_by_identity(id) {
            return Ok(w.audit_info_unchecked(id));
        }
        self.remote
            .get(id)
            .map(|d| d.audit_info.clone())
            .ok_or_else(|| WalletError::MissingAuditInfo(id.clone()))
    }

    fn token_metadata(&self, id: &Identity) -> Result<Vec<u8>, WalletError> {
        if self.wallet_by_identity(id).is_some() {
            return Ok(token_metadata_for(id));
        }
        self.remote
            .get(id)
            .map(|d| d.token_metadata.clone())
            .ok_or_else(|| WalletError::MissingAuditInfo(id.clone()))
    }

    fn register_recipient_identity(&self, data: &RecipientData) -> Result<(), WalletError> {
        data.identity.public_key()?;
        let info = AuditInfo::from_bytes(&data.audit_info)?;
        if info.identity != data.identity {
            return Err(WalletError::InvalidRecipientData(format!(
                "audit info describes [{}], not [{}]",
                info.identity, data.identity
            )));
        }
        debug!(identity = %data.identity, enrollment_id = %info.enrollment_id, "registered recipient identity");
        self.remote.insert(data.identity.clone(), data.clone());
        Ok(())
    }

    fn is_me(&self, id: &Identity) -> bool {
        self.wallet_by_identity(id).is_some()
    }

    fn signer(&self, id: &Identity) -> Result<PartyKeypair, WalletError> {
        self.wallet_by_identity(id)
            .and_then(|w| w.signer(id))
            .ok_or_else(|| WalletError::NotMine(id.clone()))
    }
}
