//! # Vault: Unspent Token Set
//!
//! The vault is the local mirror of the ledger's unspent outputs. The
//! selector reads it to pick inputs, the in-memory ledger writes it when a
//! transaction commits.
//!
//! ```text
//! token.rs : TokenId (tx, index) and UnspentToken
//! mod.rs   : TokenVault: ordered map TokenId -> UnspentToken
//! ```
//!
//! ## Design Principles
//!
//! 1. **All amounts are `u64` in smallest-unit denomination.** No floating
//!    point anywhere.
//!
//! 2. **Iteration order is the key order.** The vault is a `BTreeMap`, so
//!    first-fit selection is deterministic for a given vault content.
//!
//! 3. **Commit is all-or-nothing.** [`TokenVault::apply`] checks every
//!    input before touching the map.

pub mod token;

use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::identity::Identity;

pub use token::{TokenId, UnspentToken};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by the vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The token is not (or no longer) in the unspent set.
    #[error("token [{0}] does not exist or was already spent")]
    TokenNotFound(TokenId),

    /// An output would overwrite an existing token.
    #[error("token [{0}] already exists")]
    TokenExists(TokenId),
}

// ---------------------------------------------------------------------------
// TokenVault
// ---------------------------------------------------------------------------

/// Shared unspent token set.
#[derive(Debug, Default)]
pub struct TokenVault {
    tokens: RwLock<BTreeMap<TokenId, UnspentToken>>,
}

impl TokenVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a token, e.g. a genesis allocation.
    pub fn add(&self, token: UnspentToken) -> Result<(), VaultError> {
        let mut tokens = self.tokens.write();
        if tokens.contains_key(&token.id) {
            return Err(VaultError::TokenExists(token.id));
        }
        tokens.insert(token.id.clone(), token);
        Ok(())
    }

    /// Unspent tokens of `token_type` whose owner passes `owner_filter`, in
    /// key order.
    pub fn unspent_tokens<F>(&self, owner_filter: F, token_type: &str) -> Vec<UnspentToken>
    where
        F: Fn(&Identity) -> bool,
    {
        self.tokens
            .read()
            .values()
            .filter(|t| t.token_type == token_type && owner_filter(&t.owner))
            .cloned()
            .collect()
    }

    /// Fetch the given tokens. Fails on the first one that is not unspent.
    pub fn get_tokens(&self, ids: &[TokenId]) -> Result<Vec<UnspentToken>, VaultError> {
        let tokens = self.tokens.read();
        ids.iter()
            .map(|id| {
                tokens
                    .get(id)
                    .cloned()
                    .ok_or_else(|| VaultError::TokenNotFound(id.clone()))
            })
            .collect()
    }

    /// Whether `id` is currently unspent.
    pub fn contains(&self, id: &TokenId) -> bool {
        self.tokens.read().contains_key(id)
    }

    /// Spend `inputs` and add `outputs` atomically.
    pub fn apply(&self, inputs: &[TokenId], outputs: Vec<UnspentToken>) -> Result<(), VaultError> {
        let mut tokens = self.tokens.write();
        for id in inputs {
            if !tokens.contains_key(id) {
                return Err(VaultError::TokenNotFound(id.clone()));
            }
        }
        for out in &outputs {
            if tokens.contains_key(&out.id) {
                return Err(VaultError::TokenExists(out.id.clone()));
            }
        }
        for id in inputs {
            tokens.remove(id);
        }
        debug!(spent = inputs.len(), created = outputs.len(), "vault updated");
        for out in outputs {
            tokens.insert(out.id.clone(), out);
        }
        Ok(())
    }

    /// Sum of unspent `token_type` owned by identities passing `owner_filter`.
    pub fn balance<F>(&self, owner_filter: F, token_type: &str) -> u64
    where
        F: Fn(&Identity) -> bool,
    {
        self.unspent_tokens(owner_filter, token_type)
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.quantity))
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
