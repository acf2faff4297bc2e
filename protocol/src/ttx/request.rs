//! # Token Requests
//!
//! The token request is the part of a transaction that parties sign: a
//! list of issue, transfer and redeem actions plus application metadata,
//! anchored to the transaction ID.
//!
//! ```text
//! TokenRequest
//!   anchor             ── ledger transaction ID
//!   actions[]          ── Issue | Transfer | Redeem
//!   metadata           ── application key/value pairs
//!   signatures         ── signer identity → signature     (not signed)
//!   auditor_signatures ── auditor identity → signature    (not signed)
//! ```
//!
//! Signatures cover [`TokenRequest::marshal_to_sign`]: a bincode encoding
//! of the domain tag, anchor, actions and metadata. Once the first
//! signature is attached the request is sealed and refuses new actions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::error::{TtxError, TtxResult};
use crate::config::SIGNING_DOMAIN;
use crate::crypto::hash::sha256;
use crate::identity::{AuditInfo, Identity, RecipientData};
use crate::ledger::RwSet;
use crate::vault::{TokenId, UnspentToken};

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// A token being spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub id: TokenId,
    pub owner: Identity,
    pub token_type: String,
    pub quantity: u64,
    /// Audit info of the owner, so the auditor can attribute the spend.
    pub audit_info: Vec<u8>,
}

/// A token being created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub owner: Identity,
    pub token_type: String,
    pub quantity: u64,
    pub audit_info: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl Output {
    /// An output of `quantity` `token_type` owned by `recipient`.
    pub fn to_recipient(recipient: &RecipientData, token_type: &str, quantity: u64) -> Self {
        Self {
            owner: recipient.identity.clone(),
            token_type: token_type.to_string(),
            quantity,
            audit_info: recipient.audit_info.clone(),
            metadata: recipient.token_metadata.clone(),
        }
    }

    /// Enrollment ID from the attached audit info.
    pub fn enrollment_id(&self) -> TtxResult<String> {
        Ok(AuditInfo::from_bytes(&self.audit_info)?.enrollment_id)
    }
}

impl Input {
    /// Enrollment ID from the attached audit info.
    pub fn enrollment_id(&self) -> TtxResult<String> {
        Ok(AuditInfo::from_bytes(&self.audit_info)?.enrollment_id)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// One token operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Create new tokens. Signed by the issuer.
    Issue { issuer: Identity, outputs: Vec<Output> },
    /// Move tokens. Signed by every input owner.
    Transfer { inputs: Vec<Input>, outputs: Vec<Output> },
    /// Destroy `redeemed` units, returning any excess as change. Signed by
    /// every input owner.
    Redeem {
        inputs: Vec<Input>,
        redeemed: u64,
        change: Vec<Output>,
    },
}

impl Action {
    /// Parties whose signature the action needs.
    pub fn signers(&self) -> Vec<Identity> {
        match self {
            Action::Issue { issuer, .. } => vec![issuer.clone()],
            Action::Transfer { inputs, .. } | Action::Redeem { inputs, .. } => {
                inputs.iter().map(|i| i.owner.clone()).collect()
            }
        }
    }

    pub fn inputs(&self) -> &[Input] {
        match self {
            Action::Issue { .. } => &[],
            Action::Transfer { inputs, .. } | Action::Redeem { inputs, .. } => inputs,
        }
    }

    pub fn outputs(&self) -> &[Output] {
        match self {
            Action::Issue { outputs, .. } | Action::Transfer { outputs, .. } => outputs,
            Action::Redeem { change, .. } => change,
        }
    }

    /// Structural validity: no zero quantities, at least one input for
    /// spends, and value preserved per token type.
    pub fn check(&self) -> Result<(), String> {
        if self.outputs().iter().any(|o| o.quantity == 0) {
            return Err("zero-quantity output".to_string());
        }
        match self {
            Action::Issue { issuer, outputs } => {
                if issuer.is_none() {
                    return Err("issue without issuer".to_string());
                }
                if outputs.is_empty() {
                    return Err("issue without outputs".to_string());
                }
                Ok(())
            }
            Action::Transfer { inputs, outputs } => {
                if inputs.is_empty() {
                    return Err("transfer without inputs".to_string());
                }
                let mut balance: BTreeMap<&str, i128> = BTreeMap::new();
                for i in inputs {
                    *balance.entry(i.token_type.as_str()).or_default() += i.quantity as i128;
                }
                for o in outputs {
                    *balance.entry(o.token_type.as_str()).or_default() -= o.quantity as i128;
                }
                match balance.iter().find(|(_, v)| **v != 0) {
                    Some((t, _)) => Err(format!("transfer of [{}] does not balance", t)),
                    None => Ok(()),
                }
            }
            Action::Redeem {
                inputs,
                redeemed,
                change,
            } => {
                if inputs.is_empty() || *redeemed == 0 {
                    return Err("empty redeem".to_string());
                }
                let types: BTreeSet<&str> = inputs
                    .iter()
                    .map(|i| i.token_type.as_str())
                    .chain(change.iter().map(|o| o.token_type.as_str()))
                    .collect();
                if types.len() != 1 {
                    return Err("redeem mixes token types".to_string());
                }
                let spent: u128 = inputs.iter().map(|i| i.quantity as u128).sum();
                let kept: u128 = change.iter().map(|o| o.quantity as u128).sum();
                if spent != kept + *redeemed as u128 {
                    return Err("redeem does not balance".to_string());
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TokenRequest
// ---------------------------------------------------------------------------

/// Actions, metadata and the signatures collected over them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub anchor: String,
    pub actions: Vec<Action>,
    pub metadata: BTreeMap<String, Vec<u8>>,
    pub signatures: BTreeMap<Identity, Vec<u8>>,
    pub auditor_signatures: BTreeMap<Identity, Vec<u8>>,
}

impl TokenRequest {
    /// Empty request anchored to `anchor`.
    pub fn new(anchor: &str) -> Self {
        Self {
            anchor: anchor.to_string(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// `true` once any signature is attached.
    pub fn is_sealed(&self) -> bool {
        !self.signatures.is_empty() || !self.auditor_signatures.is_empty()
    }

    /// Append an action. Fails on a sealed request.
    pub fn push_action(&mut self, action: Action) -> TtxResult<()> {
        if self.is_sealed() {
            return Err(TtxError::InvalidInput(format!(
                "request [{}] is already signed",
                self.anchor
            )));
        }
        self.actions.push(action);
        Ok(())
    }

    /// Canonical bytes every signer signs.
    pub fn marshal_to_sign(&self) -> TtxResult<Vec<u8>> {
        let body = (SIGNING_DOMAIN, &self.anchor, &self.actions, &self.metadata);
        Ok(bincode::serialize(&body)?)
    }

    /// SHA-256 of [`TokenRequest::marshal_to_sign`].
    pub fn digest(&self) -> TtxResult<[u8; 32]> {
        Ok(sha256(&self.marshal_to_sign()?))
    }

    /// Issuers and input owners, de-duplicated, in first-seen order.
    pub fn required_signers(&self) -> Vec<Identity> {
        let mut seen = BTreeSet::new();
        self.actions
            .iter()
            .flat_map(|a| a.signers())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Owners of the outputs, de-duplicated, in first-seen order.
    pub fn receivers(&self) -> Vec<Identity> {
        let mut seen = BTreeSet::new();
        self.outputs()
            .map(|o| o.owner.clone())
            .filter(|id| !id.is_none() && seen.insert(id.clone()))
            .collect()
    }

    /// Every token spent by the request.
    pub fn inputs(&self) -> Vec<TokenId> {
        self.actions
            .iter()
            .flat_map(|a| a.inputs().iter().map(|i| i.id.clone()))
            .collect()
    }

    /// Every output, in action order.
    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.actions.iter().flat_map(|a| a.outputs().iter())
    }

    /// Validity of the request as a whole.
    pub fn check(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("empty token request".to_string());
        }
        for (i, action) in self.actions.iter().enumerate() {
            action.check().map_err(|e| format!("action {}: {}", i, e))?;
        }
        let inputs = self.inputs();
        let unique: BTreeSet<_> = inputs.iter().collect();
        if unique.len() != inputs.len() {
            return Err("token spent twice".to_string());
        }
        Ok(())
    }

    /// Ledger read/write set: spent inputs, and outputs numbered
    /// `(anchor, n)` in action order.
    pub fn rwset(&self) -> RwSet {
        RwSet {
            reads: self.inputs(),
            writes: self
                .outputs()
                .enumerate()
                .map(|(n, o)| {
                    UnspentToken::new(
                        TokenId::new(self.anchor.clone(), n as u64),
                        o.owner.clone(),
                        &o.token_type,
                        o.quantity,
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> Identity {
        Identity::from_bytes(vec![b; 32])
    }

    fn input(n: u64, owner: u8, q: u64) -> Input {
        Input {
            id: TokenId::new("g", n),
            owner: id(owner),
            token_type: "USD".into(),
            quantity: q,
            audit_info: vec![],
        }
    }

    fn output(owner: u8, q: u64) -> Output {
        Output {
            owner: id(owner),
            token_type: "USD".into(),
            quantity: q,
            audit_info: vec![],
            metadata: vec![],
        }
    }

    #[test]
    fn required_signers_are_unique_and_ordered() {
        let mut req = TokenRequest::new("tx");
        req.push_action(Action::Transfer {
            inputs: vec![input(0, 2, 5), input(1, 1, 5)],
            outputs: vec![output(3, 10)],
        })
        .unwrap();
        req.push_action(Action::Issue {
            issuer: id(9),
            outputs: vec![output(3, 1)],
        })
        .unwrap();
        req.push_action(Action::Transfer {
            inputs: vec![input(2, 2, 1)],
            outputs: vec![output(4, 1)],
        })
        .unwrap();
        assert_eq!(req.required_signers(), vec![id(2), id(1), id(9)]);
        assert_eq!(req.receivers(), vec![id(3), id(4)]);
    }

    #[test]
    fn unbalanced_transfer_fails_check() {
        let mut req = TokenRequest::new("tx");
        req.push_action(Action::Transfer {
            inputs: vec![input(0, 1, 5)],
            outputs: vec![output(2, 6)],
        })
        .unwrap();
        assert!(req.check().unwrap_err().contains("does not balance"));
    }

    #[test]
    fn double_spend_within_request_fails_check() {
        let mut req = TokenRequest::new("tx");
        for _ in 0..2 {
            req.push_action(Action::Transfer {
                inputs: vec![input(0, 1, 5)],
                outputs: vec![output(2, 5)],
            })
            .unwrap();
        }
        assert_eq!(req.check().unwrap_err(), "token spent twice");
    }

    #[test]
    fn redeem_balances_with_change() {
        let ok = Action::Redeem {
            inputs: vec![input(0, 1, 10)],
            redeemed: 7,
            change: vec![output(1, 3)],
        };
        assert!(ok.check().is_ok());
        let bad = Action::Redeem {
            inputs: vec![input(0, 1, 10)],
            redeemed: 8,
            change: vec![output(1, 3)],
        };
        assert!(bad.check().is_err());
    }

    #[test]
    fn sealed_request_refuses_actions() {
        let mut req = TokenRequest::new("tx");
        req.signatures.insert(id(1), vec![1]);
        assert!(req
            .push_action(Action::Issue {
                issuer: id(1),
                outputs: vec![output(2, 1)]
            })
            .is_err());
    }

    #[test]
    fn signatures_do_not_change_signed_bytes() {
        let mut req = TokenRequest::new("tx");
        req.push_action(Action::Issue {
            issuer: id(1),
            outputs: vec![output(2, 1)],
        })
        .unwrap();
        let before = req.marshal_to_sign().unwrap();
        req.signatures.insert(id(1), vec![7; 64]);
        assert_eq!(req.marshal_to_sign().unwrap(), before);
    }

    #[test]
    fn rwset_numbers_outputs_across_actions() {
        let mut req = TokenRequest::new("tx");
        req.push_action(Action::Issue {
            issuer: id(1),
            outputs: vec![output(2, 1), output(3, 2)],
        })
        .unwrap();
        req.push_action(Action::Transfer {
            inputs: vec![input(0, 1, 4)],
            outputs: vec![output(4, 4)],
        })
        .unwrap();
        let rw = req.rwset();
        assert_eq!(rw.reads, vec![TokenId::new("g", 0)]);
        assert_eq!(rw.writes[2].id, TokenId::new("tx", 2));
        assert_eq!(rw.writes[2].quantity, 4);
    }
}
