//! # Transaction Database
//!
//! A party's record of the transactions it takes part in, on top of a
//! [`StatusStore`]. Appending a transaction records it `Pending` and
//! subscribes the store to ledger finality, so the status flips to
//! `Confirmed`/`Deleted` without anybody polling the ledger.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::TtxResult;
use super::transaction::Transaction;
use crate::identity::Identity;
use crate::ledger::{FinalityListener, Ledger, Networks};
use crate::storage::{StatusCommitter, StatusStore, TxStatus};

/// A transaction whose stored status disagrees with the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMismatch {
    pub tx_id: String,
    pub stored: TxStatus,
    pub ledger: TxStatus,
}

/// Status store plus ledger finality wiring.
pub struct TransactionDb {
    store: Arc<dyn StatusStore>,
    networks: Arc<Networks>,
    committer: Arc<dyn FinalityListener>,
    listeners: Vec<Arc<dyn FinalityListener>>,
}

impl TransactionDb {
    pub fn new(store: Arc<dyn StatusStore>, networks: Arc<Networks>) -> Self {
        let committer: Arc<dyn FinalityListener> = Arc::new(StatusCommitter::new(store.clone()));
        Self {
            store,
            networks,
            committer,
            listeners: Vec::new(),
        }
    }

    /// Also forward ledger finality of every appended transaction to
    /// `listener`.
    pub fn with_listener(mut self, listener: Arc<dyn FinalityListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Record `tx` as `Pending` and register for its finality.
    pub fn append(&self, tx: &Transaction) -> TtxResult<()> {
        let ledger = self
            .networks
            .get(&tx.tms_id().network, &tx.tms_id().channel)?;
        self.store.append_transaction(tx.id())?;
        ledger.add_finality_listener(tx.id(), self.committer.clone());
        for l in &self.listeners {
            ledger.add_finality_listener(tx.id(), l.clone());
        }
        debug!(tx_id = %tx.id(), "transaction appended");
        Ok(())
    }

    /// Cache the token request of `tx`.
    pub fn cache_request(&self, tx: &Transaction) -> TtxResult<()> {
        let raw = bincode::serialize(tx.request())?;
        self.store.cache_request(tx.id(), &raw)?;
        Ok(())
    }

    /// Cache the request, logging instead of failing.
    pub(crate) fn cache_request_best_effort(&self, tx: &Transaction) {
        if let Err(e) = self.cache_request(tx) {
            warn!(tx_id = %tx.id(), error = %e, "failed to cache token request");
        }
    }

    pub fn append_endorsement_ack(&self, tx_id: &str, party: &Identity, sigma: &[u8]) -> TtxResult<()> {
        self.store.add_endorsement_ack(tx_id, party, sigma)?;
        Ok(())
    }

    pub fn endorsement_acks(&self, tx_id: &str) -> TtxResult<BTreeMap<Identity, Vec<u8>>> {
        Ok(self.store.endorsement_acks(tx_id)?)
    }

    pub fn status(&self, tx_id: &str) -> TtxResult<(TxStatus, String)> {
        Ok(self.store.get_status(tx_id)?)
    }

    /// Compare every recorded transaction with the ledger's view.
    /// Transactions the ledger does not know are skipped.
    pub fn check(&self, ledger: &dyn Ledger) -> TtxResult<Vec<StatusMismatch>> {
        let mut out = Vec::new();
        for record in self.store.transactions()? {
            let (ledger_status, _) = ledger.get_status(&record.tx_id)?;
            if ledger_status == TxStatus::Unknown || ledger_status == record.status {
                continue;
            }
            warn!(
                tx_id = %record.tx_id,
                stored = %record.status,
                ledger = %ledger_status,
                "stored status disagrees with ledger"
            );
            out.push(StatusMismatch {
                tx_id: record.tx_id,
                stored: record.status,
                ledger: ledger_status,
            });
        }
        Ok(out)
    }
}
