//! # In-Memory Ledger
//!
//! A single-peer ledger living in the same process as the parties. It
//! endorses read/write sets against the shared [`TokenVault`], orders
//! envelopes in arrival order and commits each one after `commit_delay`:
//!
//! ```text
//! broadcast ──► Pending ──(commit_delay)──► vault.apply ──► Confirmed
//!                                              │ fails
//!                                              └──────────► Deleted
//! ```
//!
//! With auto-commit turned off, envelopes stay `Pending` until
//! [`MemoryLedger::commit`] or [`MemoryLedger::set_status`] is called,
//! which is how tests pin a transaction in a given state.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Envelope, FinalityListener, Ledger, LedgerError, LedgerResult, RwSet};
use crate::crypto::keys::PartyKeypair;
use crate::identity::Identity;
use crate::storage::TxStatus;
use crate::vault::TokenVault;

struct Inner {
    network: String,
    channel: String,
    vault: Arc<TokenVault>,
    endorser: PartyKeypair,
    commit_delay: Duration,
    auto_commit: AtomicBool,
    statuses: RwLock<HashMap<String, (TxStatus, String)>>,
    envelopes: RwLock<HashMap<String, Envelope>>,
    stored: RwLock<HashMap<String, Envelope>>,
    listeners: Mutex<HashMap<String, Vec<Arc<dyn FinalityListener>>>>,
    broadcasts: AtomicU64,
}

/// In-process ledger. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

impl MemoryLedger {
    /// A ledger for `network`/`channel` over `vault`, committing
    /// immediately after broadcast.
    pub fn new(network: &str, channel: &str, vault: Arc<TokenVault>) -> Self {
        Self::with_commit_delay(network, channel, vault, Duration::ZERO)
    }

    /// Like [`MemoryLedger::new`], committing `delay` after broadcast.
    pub fn with_commit_delay(
        network: &str,
        channel: &str,
        vault: Arc<TokenVault>,
        delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                network: network.to_string(),
                channel: channel.to_string(),
                vault,
                endorser: PartyKeypair::generate(),
                commit_delay: delay,
                auto_commit: AtomicBool::new(true),
                statuses: RwLock::new(HashMap::new()),
                envelopes: RwLock::new(HashMap::new()),
                stored: RwLock::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                broadcasts: AtomicU64::new(0),
            }),
        }
    }

    /// Turn automatic commit after broadcast on or off.
    pub fn set_auto_commit(&self, enabled: bool) {
        self.inner.auto_commit.store(enabled, Ordering::SeqCst);
    }

    /// Identity of the endorsing peer.
    pub fn endorser(&self) -> Identity {
        Identity::from_public_key(&self.inner.endorser.public_key())
    }

    /// The vault the ledger commits into.
    pub fn vault(&self) -> &Arc<TokenVault> {
        &self.inner.vault
    }

    /// Number of envelopes accepted by [`Ledger::broadcast`].
    pub fn broadcast_count(&self) -> u64 {
        self.inner.broadcasts.load(Ordering::SeqCst)
    }

    /// Validate and commit a broadcast transaction now.
    pub fn commit(&self, tx_id: &str) -> LedgerResult<TxStatus> {
        self.inner.commit(tx_id)
    }

    /// Force a status, notifying finality listeners when terminal.
    pub fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) {
        self.inner.finalize(tx_id, status, message);
    }
}

impl Inner {
    fn commit(&self, tx_id: &str) -> LedgerResult<TxStatus> {
        let envelope = self
            .envelopes
            .read()
            .get(tx_id)
            .cloned()
            .ok_or_else(|| LedgerError::InvalidEnvelope(format!("[{}] was never broadcast", tx_id)))?;

        if let Some((status, _)) = self.statuses.read().get(tx_id) {
            if status.is_terminal() {
                return Ok(*status);
            }
        }

        let (status, message) = match self
            .vault
            .apply(&envelope.rwset.reads, envelope.rwset.writes.clone())
        {
            Ok(()) => (TxStatus::Confirmed, String::new()),
            Err(e) => (TxStatus::Deleted, format!("invalid transaction: {}", e)),
        };
        self.finalize(tx_id, status, &message);
        Ok(status)
    }

    fn finalize(&self, tx_id: &str, status: TxStatus, message: &str) {
        self.statuses
            .write()
            .insert(tx_id.to_string(), (status, message.to_string()));
        if !status.is_terminal() {
            return;
        }
        match status {
            TxStatus::Confirmed => info!(tx_id = %tx_id, "transaction committed"),
            _ => warn!(tx_id = %tx_id, reason = %message, "transaction rejected"),
        }
        let listeners = self.listeners.lock().remove(tx_id).unwrap_or_default();
        for l in listeners {
            l.on_status(tx_id, status, message);
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn network(&self) -> &str {
        &self.inner.network
    }

    fn channel(&self) -> &str {
        &self.inner.channel
    }

    async fn request_approval(
        &self,
        namespace: &str,
        tx_id: &str,
        creator: &Identity,
        rwset: RwSet,
        request_digest: Vec<u8>,
    ) -> LedgerResult<Envelope> {
        if tx_id.is_empty() {
            return Err(LedgerError::Rejected {
                tx_id: String::new(),
                reason: "empty transaction id".to_string(),
            });
        }
        if let Err(e) = self.inner.vault.get_tokens(&rwset.reads) {
            return Err(LedgerError::Rejected {
                tx_id: tx_id.to_string(),
                reason: e.to_string(),
            });
        }

        let mut envelope = Envelope {
            tx_id: tx_id.to_string(),
            network: self.inner.network.clone(),
            channel: self.inner.channel.clone(),
            namespace: namespace.to_string(),
            creator: creator.clone(),
            rwset,
            request_digest,
            endorser: self.endorser(),
            endorsement: Vec::new(),
        };
        envelope.endorsement = self
            .inner
            .endorser
            .sign(&envelope.signing_bytes()?)
            .into_vec();
        debug!(tx_id = %tx_id, "approval granted");
        Ok(envelope)
    }

    async fn broadcast(&self, envelope: &Envelope) -> LedgerResult<()> {
        envelope.verify()?;
        if envelope.endorser != self.endorser() {
            return Err(LedgerError::InvalidEnvelope(
                "envelope endorsed by an unknown peer".to_string(),
            ));
        }
        let tx_id = envelope.tx_id.clone();
        {
            let mut envelopes = self.inner.envelopes.write();
            if envelopes.contains_key(&tx_id) {
                debug!(tx_id = %tx_id, "envelope already broadcast");
                return Ok(());
            }
            envelopes.insert(tx_id.clone(), envelope.clone());
        }
        self.inner
            .statuses
            .write()
            .insert(tx_id.clone(), (TxStatus::Pending, String::new()));
        self.inner.broadcasts.fetch_add(1, Ordering::SeqCst);
        debug!(tx_id = %tx_id, "envelope broadcast");

        if self.inner.auto_commit.load(Ordering::SeqCst) {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if !inner.commit_delay.is_zero() {
                    tokio::time::sleep(inner.commit_delay).await;
                }
                if let Err(e) = inner.commit(&tx_id) {
                    warn!(tx_id = %tx_id, error = %e, "commit failed");
                }
            });
        }
        Ok(())
    }

    fn get_rwset(&self, tx_id: &str) -> LedgerResult<Option<RwSet>> {
        if let Some(env) = self.inner.stored.read().get(tx_id) {
            return Ok(Some(env.rwset.clone()));
        }
        Ok(self.inner.envelopes.read().get(tx_id).map(|e| e.rwset.clone()))
    }

    fn store_envelope(&self, tx_id: &str, raw: &[u8]) -> LedgerResult<()> {
        let envelope = Envelope::from_bytes(raw)?;
        if envelope.tx_id != tx_id {
            return Err(LedgerError::InvalidEnvelope(format!(
                "envelope is for [{}], expected [{}]",
                envelope.tx_id, tx_id
            )));
        }
        envelope.verify()?;
        self.inner.stored.write().insert(tx_id.to_string(), envelope);
        Ok(())
    }

    fn get_status(&self, tx_id: &str) -> LedgerResult<(TxStatus, String)> {
        Ok(self
            .inner
            .statuses
            .read()
            .get(tx_id)
            .cloned()
            .unwrap_or((TxStatus::Unknown, String::new())))
    }

    fn add_finality_listener(&self, tx_id: &str, listener: Arc<dyn FinalityListener>) {
        // The status lock is held while registering so a concurrent
        // finalize cannot slip between the check and the insert.
        let statuses = self.inner.statuses.read();
        if let Some((status, message)) = statuses.get(tx_id) {
            if status.is_terminal() {
                let (status, message) = (*status, message.clone());
                drop(statuses);
                listener.on_status(tx_id, status, &message);
                return;
            }
        }
        self.inner
            .listeners
            .lock()
            .entry(tx_id.to_string())
            .or_default()
            .push(listener);
    }

    fn remove_finality_listener(&self, tx_id: &str, listener: &Arc<dyn FinalityListener>) {
        let mut table = self.inner.listeners.lock();
        if let Some(list) = table.get_mut(tx_id) {
            list.retain(|l| !Arc::ptr_eq(l, listener));
            if list.is_empty() {
                table.remove(tx_id);
            }
        }
    }
}
