//! # Transactions
//!
//! A [`Transaction`] is the aggregate every protocol step works on:
//!
//! ```text
//! Transaction
//! ├── Payload                    (travels between parties)
//! │   ├── tx_id: TxId            nonce + creator
//! │   ├── id                     hex(sha256(nonce || creator)), fixed at creation
//! │   ├── tms_id                 network / channel / namespace
//! │   ├── signer                 creator identity
//! │   ├── transient              sorted key/value side data, never signed
//! │   ├── token_request          actions + signatures
//! │   └── envelope               set once the ledger approved the request
//! └── TxOptions                  (local only, read-only after construction)
//! ```
//!
//! The binary form ([`Transaction::to_bytes`]) is bincode over a flat wire
//! struct. Maps are `BTreeMap`s, so the encoding is deterministic and a
//! decode/encode round trip is byte-identical.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::context::PartyContext;
use super::error::{TtxError, TtxResult};
use super::request::{Action, Input, Output, TokenRequest};
use crate::crypto::hash::sha256_multi;
use crate::identity::{Identity, RecipientData, Wallet, WalletService};
use crate::ledger::Envelope;
use crate::vault::TokenId;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Token management scope: which ledger and namespace a transaction
/// belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TmsId {
    pub network: String,
    pub channel: String,
    pub namespace: String,
}

impl TmsId {
    pub fn new(network: &str, channel: &str, namespace: &str) -> Self {
        Self {
            network: network.to_string(),
            channel: channel.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl fmt::Display for TmsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.channel, self.namespace)
    }
}

/// Origin of a transaction ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxId {
    pub nonce: Vec<u8>,
    pub creator: Vec<u8>,
}

impl TxId {
    /// A fresh random nonce for `creator`.
    pub fn new(creator: &Identity) -> Self {
        Self {
            nonce: rand::random::<[u8; 24]>().to_vec(),
            creator: creator.as_bytes().to_vec(),
        }
    }

    /// The ledger ID: `hex(sha256(nonce || creator))`.
    pub fn compute(&self) -> String {
        hex::encode(sha256_multi(&[&self.nonce, &self.creator]))
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-transaction settings, fixed at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Auditor that must sign the transaction, if any.
    pub auditor: Option<Identity>,
    /// Use fresh pseudonyms for change outputs.
    pub anonymous: bool,
    /// Overrides the session timeout of interactive rounds.
    pub timeout: Option<Duration>,
    /// Skip caching the token request after ordering.
    pub no_caching_request: bool,
}

impl TxOptions {
    pub fn with_auditor(mut self, auditor: Identity) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_request_caching(mut self) -> Self {
        self.no_caching_request = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The part of a transaction shared between parties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub tx_id: TxId,
    pub id: String,
    pub tms_id: TmsId,
    pub signer: Identity,
    pub transient: BTreeMap<String, Vec<u8>>,
    pub token_request: TokenRequest,
    pub envelope: Option<Envelope>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireTransaction {
    nonce: Vec<u8>,
    creator: Vec<u8>,
    #[serde(rename = "ID")]
    id: String,
    network: String,
    channel: String,
    namespace: String,
    signer: Vec<u8>,
    transient: BTreeMap<String, Vec<u8>>,
    token_request: Vec<u8>,
    envelope: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A token transaction under construction or in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    payload: Payload,
    options: TxOptions,
}

impl Transaction {
    /// A new, empty transaction created by `signer`.
    pub fn new(signer: &Identity, tms_id: TmsId, options: TxOptions) -> Self {
        let tx_id = TxId::new(signer);
        let id = tx_id.compute();
        debug!(tx_id = %id, tms = %tms_id, "new transaction");
        Self {
            payload: Payload {
                tx_id,
                token_request: TokenRequest::new(&id),
                id,
                tms_id,
                signer: signer.clone(),
                transient: BTreeMap::new(),
                envelope: None,
            },
            options,
        }
    }

    /// Decode a transaction received from another party. Local options
    /// start at their defaults.
    pub fn from_bytes(raw: &[u8]) -> TtxResult<Self> {
        Self::from_bytes_with_options(raw, TxOptions::default())
    }

    /// Decode with explicit local options.
    pub fn from_bytes_with_options(raw: &[u8], options: TxOptions) -> TtxResult<Self> {
        if raw.is_empty() {
            return Err(TtxError::InvalidInput("empty transaction".to_string()));
        }
        let wire: WireTransaction = bincode::deserialize(raw)?;
        let tx_id = TxId {
            nonce: wire.nonce,
            creator: wire.creator,
        };
        if tx_id.compute() != wire.id {
            return Err(TtxError::InvalidInput(format!(
                "transaction id [{}] does not match its nonce and creator",
                wire.id
            )));
        }
        let token_request: TokenRequest = bincode::deserialize(&wire.token_request)?;
        let envelope = if wire.envelope.is_empty() {
            None
        } else {
            Some(Envelope::from_bytes(&wire.envelope)?)
        };
        Ok(Self {
            payload: Payload {
                tx_id,
                id: wire.id,
                tms_id: TmsId {
                    network: wire.network,
                    channel: wire.channel,
                    namespace: wire.namespace,
                },
                signer: Identity::from_bytes(wire.signer),
                transient: wire.transient,
                token_request,
                envelope,
            },
            options,
        })
    }

    /// Encode for another party.
    pub fn to_bytes(&self) -> TtxResult<Vec<u8>> {
        let p = &self.payload;
        let envelope = match &p.envelope {
            Some(env) => env.to_bytes()?,
            None => Vec::new(),
        };
        let wire = WireTransaction {
            nonce: p.tx_id.nonce.clone(),
            creator: p.tx_id.creator.clone(),
            id: p.id.clone(),
            network: p.tms_id.network.clone(),
            channel: p.tms_id.channel.clone(),
            namespace: p.tms_id.namespace.clone(),
            signer: p.signer.as_bytes().to_vec(),
            transient: p.transient.clone(),
            token_request: bincode::serialize(&p.token_request)?,
            envelope,
        };
        Ok(bincode::serialize(&wire)?)
    }

    // -- accessors ----------------------------------------------------------

    /// Ledger transaction ID.
    pub fn id(&self) -> &str {
        &self.payload.id
    }

    pub fn tx_id(&self) -> &TxId {
        &self.payload.tx_id
    }

    pub fn tms_id(&self) -> &TmsId {
        &self.payload.tms_id
    }

    /// Creator of the transaction.
    pub fn signer(&self) -> &Identity {
        &self.payload.signer
    }

    pub fn options(&self) -> &TxOptions {
        &self.options
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn request(&self) -> &TokenRequest {
        &self.payload.token_request
    }

    pub(crate) fn request_mut(&mut self) -> &mut TokenRequest {
        &mut self.payload.token_request
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        self.payload.envelope.as_ref()
    }

    pub(crate) fn set_envelope(&mut self, envelope: Envelope) {
        self.payload.envelope = Some(envelope);
    }

    pub fn set_transient(&mut self, key: &str, value: &[u8]) {
        self.payload.transient.insert(key.to_string(), value.to_vec());
    }

    pub fn get_transient(&self, key: &str) -> Option<&[u8]> {
        self.payload.transient.get(key).map(|v| v.as_slice())
    }

    /// Application metadata carried (and signed) in the token request.
    pub fn set_application_metadata(&mut self, key: &str, value: &[u8]) -> TtxResult<()> {
        let req = self.request_mut();
        if req.is_sealed() {
            return Err(TtxError::InvalidInput("request is already signed".to_string()));
        }
        req.metadata.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Tokens spent by this transaction.
    pub fn inputs(&self) -> Vec<TokenId> {
        self.request().inputs()
    }

    /// Outputs created by this transaction.
    pub fn outputs(&self) -> Vec<Output> {
        self.request().outputs().cloned().collect()
    }

    // -- validity -----------------------------------------------------------

    /// The request is non-empty, anchored to this ID, and every action
    /// balances.
    pub fn validate(&self) -> TtxResult<()> {
        let req = self.request();
        if req.anchor != self.payload.id {
            return Err(TtxError::InvalidInput(format!(
                "request anchored to [{}], expected [{}]",
                req.anchor, self.payload.id
            )));
        }
        req.check().map_err(TtxError::InvalidInput)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    // -- actions ------------------------------------------------------------

    /// Issue `quantity` new `token_type` tokens to `recipient`.
    pub fn issue(
        &mut self,
        issuer: &Identity,
        token_type: &str,
        quantity: u64,
        recipient: &RecipientData,
    ) -> TtxResult<()> {
        if quantity == 0 {
            return Err(TtxError::InvalidInput("cannot issue zero tokens".to_string()));
        }
        self.request_mut().push_action(Action::Issue {
            issuer: issuer.clone(),
            outputs: vec![Output::to_recipient(recipient, token_type, quantity)],
        })
    }

    /// Transfer `values[i]` of `token_type` from `wallet` to
    /// `recipients[i]`. Inputs are selected and locked for this
    /// transaction; any excess goes back to the wallet as change.
    pub async fn transfer(
        &mut self,
        ctx: &PartyContext,
        wallet: &Wallet,
        token_type: &str,
        values: &[u64],
        recipients: &[RecipientData],
    ) -> TtxResult<()> {
        if values.is_empty() || values.len() != recipients.len() {
            return Err(TtxError::InvalidInput(
                "values and recipients must be non-empty and of equal length".to_string(),
            ));
        }
        if values.iter().any(|v| *v == 0) {
            return Err(TtxError::InvalidInput("cannot transfer zero tokens".to_string()));
        }
        if self.request().is_sealed() {
            return Err(TtxError::InvalidInput("request is already signed".to_string()));
        }
        let total = values
            .iter()
            .try_fold(0u64, |acc, v| acc.checked_add(*v))
            .ok_or_else(|| TtxError::InvalidInput("transfer amount overflows".to_string()))?;

        let (inputs, sum) = self.select_inputs(ctx, wallet, token_type, total).await?;
        let mut outputs: Vec<Output> = values
            .iter()
            .zip(recipients)
            .map(|(v, r)| Output::to_recipient(r, token_type, *v))
            .collect();
        if sum > total {
            outputs.push(Output::to_recipient(
                &self.change_recipient(wallet),
                token_type,
                sum - total,
            ));
        }
        self.request_mut()
            .push_action(Action::Transfer { inputs, outputs })
    }

    /// Redeem `amount` of `token_type` held by `wallet`.
    pub async fn redeem(
        &mut self,
        ctx: &PartyContext,
        wallet: &Wallet,
        token_type: &str,
        amount: u64,
    ) -> TtxResult<()> {
        if amount == 0 {
            return Err(TtxError::InvalidInput("cannot redeem zero tokens".to_string()));
        }
        if self.request().is_sealed() {
            return Err(TtxError::InvalidInput("request is already signed".to_string()));
        }
        let (inputs, sum) = self.select_inputs(ctx, wallet, token_type, amount).await?;
        let mut change = Vec::new();
        if sum > amount {
            change.push(Output::to_recipient(
                &self.change_recipient(wallet),
                token_type,
                sum - amount,
            ));
        }
        self.request_mut().push_action(Action::Redeem {
            inputs,
            redeemed: amount,
            change,
        })
    }

    /// Unlock every token this transaction reserved. Safe to call more
    /// than once.
    pub fn release(&self, ctx: &PartyContext) -> usize {
        let released = ctx.selector().unlock(self.id());
        debug!(tx_id = %self.id(), released, "released transaction tokens");
        released
    }

    fn change_recipient(&self, wallet: &Wallet) -> RecipientData {
        if self.options.anonymous {
            wallet.recipient_data()
        } else {
            wallet.default_recipient_data()
        }
    }

    async fn select_inputs(
        &self,
        ctx: &PartyContext,
        wallet: &Wallet,
        token_type: &str,
        amount: u64,
    ) -> TtxResult<(Vec<Input>, u64)> {
        let (ids, sum) = ctx
            .selector()
            .select(|owner| wallet.contains(owner), amount, token_type, self.id())
            .await?;
        let tokens = match ctx.vault().get_tokens(&ids) {
            Ok(tokens) => tokens,
            Err(e) => {
                ctx.selector().locker().unlock_ids(&ids);
                return Err(e.into());
            }
        };
        let mut inputs = Vec::with_capacity(tokens.len());
        for t in tokens {
            let audit_info = match ctx.wallets().audit_info(&t.owner) {
                Ok(info) => info,
                Err(e) => {
                    ctx.selector().locker().unlock_ids(&ids);
                    return Err(e.into());
                }
            };
            inputs.push(Input {
                id: t.id,
                owner: t.owner,
                token_type: t.token_type,
                quantity: t.quantity,
                audit_info,
            });
        }
        Ok((inputs, sum))
    }
}
