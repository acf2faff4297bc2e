//! # Token Selector
//!
//! Picks unspent tokens that cover an amount and reserves them for one
//! transaction until it commits, aborts, or is released.
//!
//! ## Algorithm
//!
//! Each attempt walks the owner's unspent tokens of the requested type in
//! vault order (first fit, no optimality):
//!
//! ```text
//! for token in unspent(owner, type):
//!     uncertified?        → count as "not certified", skip
//!     lock(token) fails   → count as "potential" (someone else holds it)
//!     locked              → sum += quantity, potential += quantity
//!     sum >= amount       → stop
//! sum >= amount:
//!     re-read the picked tokens from the vault (a commit may have spent
//!     them meanwhile) → success, or concurrency issue
//! otherwise unlock what was picked, sleep, retry
//! ```
//!
//! The first attempt does not reclaim locks (unless it is the only one);
//! retries may take over locks of `Deleted` transactions.
//!
//! When all attempts fail the error says why, so callers can decide to
//! retry later ([`SelectorError::is_retryable`]) or give up.

pub mod locker;

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SelectorConfig;
use crate::identity::Identity;
use crate::vault::{TokenId, TokenVault};

pub use locker::Locker;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a selection failed.
#[derive(Debug, Error)]
pub enum SelectorError {
    /// The owner does not hold enough tokens of this type at all.
    #[error("insufficient funds, only [{available}] tokens of type [{token_type}] are available, but [{requested}] were requested")]
    InsufficientFunds {
        token_type: String,
        requested: u64,
        available: u64,
    },

    /// Enough tokens exist, but some are locked by pending transactions.
    #[error("sufficient funds but partially locked: [{requested}] of type [{token_type}] requested, [{available}] free, [{potential}] including locked")]
    SufficientButLockedFunds {
        token_type: String,
        requested: u64,
        available: u64,
        potential: u64,
    },

    /// Enough tokens exist, but part of them are not certified yet.
    #[error("sufficient funds but not certified: [{requested}] of type [{token_type}] requested, [{certified}] certified")]
    SufficientButNotCertified {
        token_type: String,
        requested: u64,
        certified: u64,
    },

    /// The picked tokens were spent by a concurrent commit.
    #[error("sufficient funds of type [{token_type}] but a concurrent transaction spent the selected tokens")]
    SufficientFundsButConcurrencyIssue { token_type: String },

    /// The token is reserved by another transaction.
    #[error("token [{token}] already locked by [{holder}]")]
    AlreadyLocked { token: TokenId, holder: String },
}

impl SelectorError {
    /// Contention errors that may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SelectorError::SufficientButLockedFunds { .. }
                | SelectorError::SufficientFundsButConcurrencyIssue { .. }
                | SelectorError::AlreadyLocked { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// First-fit token selector over a vault and a lock table.
pub struct Selector {
    vault: Arc<TokenVault>,
    locker: Arc<Locker>,
    config: SelectorConfig,
}

impl Selector {
    pub fn new(vault: Arc<TokenVault>, locker: Arc<Locker>, config: SelectorConfig) -> Self {
        Self {
            vault,
            locker,
            config,
        }
    }

    /// The lock table backing this selector.
    pub fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    /// Select and lock tokens of `token_type` owned by identities passing
    /// `owner_filter` until their sum covers `amount`. Returns the locked
    /// IDs and their sum (which may exceed `amount`).
    pub async fn select<F>(
        &self,
        owner_filter: F,
        amount: u64,
        token_type: &str,
        tx_id: &str,
    ) -> Result<(Vec<TokenId>, u64), SelectorError>
    where
        F: Fn(&Identity) -> bool,
    {
        if amount == 0 {
            return Ok((Vec::new(), 0));
        }
        let num_retry = self.config.num_retry.max(1);
        let mut sum = 0u64;
        let mut potential = 0u64;
        let mut uncertified = 0u64;
        let mut concurrency_issue = false;

        for attempt in 0..num_retry {
            let reclaim = num_retry == 1 || attempt > 0;
            let mut selected = Vec::new();
            sum = 0;
            potential = 0;
            uncertified = 0;
            concurrency_issue = false;

            for token in self.vault.unspent_tokens(&owner_filter, token_type) {
                if !token.certified {
                    uncertified = uncertified.saturating_add(token.quantity);
                    continue;
                }
                if let Err(e) = self.locker.lock(&token.id, tx_id, reclaim) {
                    debug!(tx_id = %tx_id, error = %e, "token not available");
                    potential = potential.saturating_add(token.quantity);
                    continue;
                }
                selected.push(token.id.clone());
                sum = sum.saturating_add(token.quantity);
                potential = potential.saturating_add(token.quantity);
                if sum >= amount {
                    break;
                }
            }

            if sum >= amount {
                match self.vault.get_tokens(&selected) {
                    Ok(_) => {
                        debug!(tx_id = %tx_id, tokens = selected.len(), sum, "tokens selected");
                        return Ok((selected, sum));
                    }
                    Err(e) => {
                        warn!(tx_id = %tx_id, error = %e, "selected tokens vanished, retrying");
                        concurrency_issue = true;
                    }
                }
            }

            let not_locked = self.locker.unlock_ids(&selected);
            if !not_locked.is_empty() {
                warn!(tx_id = %tx_id, count = not_locked.len(), "tokens were not locked while unlocking");
            }
            if attempt + 1 < num_retry {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }

        let token_type = token_type.to_string();
        if concurrency_issue {
            return Err(SelectorError::SufficientFundsButConcurrencyIssue { token_type });
        }
        if amount <= potential && potential != sum {
            return Err(SelectorError::SufficientButLockedFunds {
                token_type,
                requested: amount,
                available: sum,
                potential,
            });
        }
        if amount <= potential.saturating_add(uncertified) {
            return Err(SelectorError::SufficientButNotCertified {
                token_type,
                requested: amount,
                certified: potential,
            });
        }
        Err(SelectorError::InsufficientFunds {
            token_type,
            requested: amount,
            available: sum,
        })
    }

    /// Release every token reserved by `tx_id`.
    pub fn unlock(&self, tx_id: &str) -> usize {
        self.locker.unlock_by_tx_id(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStatusStore;
    use crate::vault::UnspentToken;
    use std::time::Duration;

    fn alice() -> Identity {
        Identity::from_bytes(vec![1])
    }

    fn selector_with(tokens: &[(u64, bool)]) -> Selector {
        let vault = Arc::new(TokenVault::new());
        for (i, (q, certified)) in tokens.iter().enumerate() {
            let mut t = UnspentToken::new(TokenId::new("g", i as u64), alice(), "USD", *q);
            t.certified = *certified;
            vault.add(t).unwrap();
        }
        let store = Arc::new(MemoryStatusStore::new());
        let locker = Arc::new(Locker::new(store, Duration::from_secs(60)));
        let config = SelectorConfig {
            num_retry: 2,
            retry_backoff: Duration::from_millis(5),
            ..SelectorConfig::default()
        };
        Selector::new(vault, locker, config)
    }

    #[tokio::test]
    async fn first_fit_covers_amount() {
        let s = selector_with(&[(10, true), (20, true), (30, true)]);
        let (ids, sum) = s.select(|o| *o == alice(), 25, "USD", "t1").await.unwrap();
        assert_eq!(ids, vec![TokenId::new("g", 0), TokenId::new("g", 1)]);
        assert_eq!(sum, 30);
        assert_eq!(s.locker().locked_by("t1").len(), 2);
    }

    #[tokio::test]
    async fn insufficient_funds() {
        let s = selector_with(&[(10, true)]);
        let err = s.select(|_| true, 25, "USD", "t1").await.unwrap_err();
        assert!(matches!(err, SelectorError::InsufficientFunds { available: 10, .. }));
        assert!(!err.is_retryable());
        assert!(s.locker().is_empty());
    }

    #[tokio::test]
    async fn locked_funds_are_reported_as_such() {
        let s = selector_with(&[(10, true), (20, true)]);
        s.select(|_| true, 10, "USD", "t1").await.unwrap();
        let err = s.select(|_| true, 25, "USD", "t2").await.unwrap_err();
        assert!(matches!(
            err,
            SelectorError::SufficientButLockedFunds { potential: 30, available: 20, .. }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn uncertified_funds_are_reported_as_such() {
        let s = selector_with(&[(10, true), (20, false)]);
        let err = s.select(|_| true, 25, "USD", "t1").await.unwrap_err();
        assert!(matches!(err, SelectorError::SufficientButNotCertified { certified: 10, .. }));
    }

    #[tokio::test]
    async fn unlock_frees_tokens_for_others() {
        let s = selector_with(&[(10, true)]);
        s.select(|_| true, 10, "USD", "t1").await.unwrap();
        assert_eq!(s.unlock("t1"), 1);
        assert_eq!(s.unlock("t1"), 0);
        s.select(|_| true, 10, "USD", "t2").await.unwrap();
    }

    #[tokio::test]
    async fn zero_amount_selects_nothing() {
        let s = selector_with(&[(10, true)]);
        assert_eq!(s.select(|_| true, 0, "USD", "t").await.unwrap(), (vec![], 0));
    }
}
