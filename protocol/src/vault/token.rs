//! # Tokens
//!
//! A token is an unspent output of a committed transaction: `quantity`
//! units of `token_type` owned by an [`Identity`]. It is addressed by the
//! ID of the transaction that created it plus its output index.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::Identity;

// ---------------------------------------------------------------------------
// TokenId
// ---------------------------------------------------------------------------

/// Output pointer: creating transaction and output index.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId {
    /// Ledger ID of the transaction that created the token.
    pub tx_id: String,
    /// Position among that transaction's outputs.
    pub index: u64,
}

impl TokenId {
    pub fn new(tx_id: impl Into<String>, index: u64) -> Self {
        Self {
            tx_id: tx_id.into(),
            index,
        }
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Long ledger IDs are shortened, the index is what tells tokens of
        // one transaction apart.
        let short = if self.tx_id.len() > 12 {
            &self.tx_id[..12]
        } else {
            &self.tx_id
        };
        write!(f, "{}:{}", short, self.index)
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({}:{})", self.tx_id, self.index)
    }
}

// ---------------------------------------------------------------------------
// UnspentToken
// ---------------------------------------------------------------------------

/// A spendable token held in the vault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentToken {
    pub id: TokenId,
    pub owner: Identity,
    pub token_type: String,
    pub quantity: u64,
    /// Whether the issuer certified the output. Uncertified tokens are
    /// visible but the selector refuses to spend them.
    pub certified: bool,
}

impl UnspentToken {
    /// A certified token.
    pub fn new(id: TokenId, owner: Identity, token_type: &str, quantity: u64) -> Self {
        Self {
            id,
            owner,
            token_type: token_type.to_string(),
            quantity,
            certified: true,
        }
    }

    /// Mark the token as not (yet) certified.
    pub fn uncertified(mut self) -> Self {
        self.certified = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_ids_order_by_tx_then_index() {
        let a = TokenId::new("aa", 1);
        let b = TokenId::new("aa", 2);
        let c = TokenId::new("bb", 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn display_shortens_long_tx_ids() {
        let id = TokenId::new("0123456789abcdef0123", 3);
        assert_eq!(id.to_string(), "0123456789ab:3");
        assert_eq!(TokenId::new("tx", 0).to_string(), "tx:0");
    }
}
