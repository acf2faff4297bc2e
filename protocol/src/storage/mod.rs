//! # Storage Module
//!
//! Transaction status storage. Every party keeps its own record of the
//! transactions it took part in, and of the status the ledger eventually
//! reported for each of them. The auditor keeps a separate one.
//!
//! ```text
//! status.rs     : MemoryStatusStore: parking_lot tables, for tests and demos
//! persistent.rs : SledStatusStore: sled-backed, one tree per table
//! audit.rs      : AuditLog: per-enrollment movements used by audit checks
//! ```
//!
//! Both stores implement [`StatusStore`] and share the same listener
//! fan-out ([`ListenerTable`]): whoever wants to hear about a transaction
//! registers an mpsc sender under its ID, and every `set_status` pushes a
//! [`StatusEvent`] to it without blocking.
//!
//! ## Data Flow
//!
//! ```text
//! Ledger ──finality──► StatusCommitter ──set_status──► StatusStore
//!                                                          │
//!                                           StatusEvent    ▼
//!                                      FinalityService ◄── listeners
//! ```

pub mod audit;
pub mod persistent;
pub mod status;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::identity::Identity;
use crate::ledger::FinalityListener;

pub use audit::{AuditLog, AuditRecord, Direction};
pub use persistent::SledStatusStore;
pub use status::MemoryStatusStore;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors raised by status stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transaction [{0}] not found")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a transaction as seen by a party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    /// Never recorded.
    Unknown,
    /// Recorded, finality not known yet.
    Pending,
    /// The ledger committed it.
    Confirmed,
    /// The ledger rejected it.
    Deleted,
}

impl TxStatus {
    /// `Confirmed` and `Deleted` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Deleted)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Unknown => "Unknown",
            TxStatus::Pending => "Pending",
            TxStatus::Confirmed => "Confirmed",
            TxStatus::Deleted => "Deleted",
        };
        write!(f, "{}", s)
    }
}

/// Status change pushed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Transaction the event refers to.
    pub tx_id: String,
    /// New status.
    pub status: TxStatus,
    /// Ledger message, e.g. the rejection reason.
    pub message: String,
}

/// One row of a batched status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Transaction ID.
    pub tx_id: String,
    /// Current status (`Unknown` for IDs never recorded).
    pub status: TxStatus,
    /// Status message.
    pub message: String,
}

/// A transaction as recorded by a party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Ledger transaction ID.
    pub tx_id: String,
    /// Current status.
    pub status: TxStatus,
    /// Last status message.
    pub message: String,
    /// Unix timestamp (ms) of the first append.
    pub created_at: i64,
}

impl TransactionRecord {
    /// A fresh `Pending` record.
    pub fn pending(tx_id: &str) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            status: TxStatus::Pending,
            message: String::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// StatusStore
// ---------------------------------------------------------------------------

/// Transaction status database of one party (owner or auditor role).
///
/// Implementations provide their own internal consistency; callers never
/// wrap them in further locks.
pub trait StatusStore: Send + Sync {
    /// Record a transaction as `Pending`. Appending an already known
    /// transaction keeps its current status.
    fn append_transaction(&self, tx_id: &str) -> StoreResult<()>;

    /// Update the status and notify listeners of `tx_id`.
    fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) -> StoreResult<()>;

    /// Current status; `Unknown` if never recorded.
    fn get_status(&self, tx_id: &str) -> StoreResult<(TxStatus, String)>;

    /// Statuses of many transactions in one query, in input order.
    fn get_statuses(&self, tx_ids: &[String]) -> StoreResult<Vec<StatusEntry>>;

    /// Register a listener for status changes of `tx_id`.
    fn add_status_listener(&self, tx_id: &str, listener: mpsc::Sender<StatusEvent>);

    /// Remove a listener registered with [`StatusStore::add_status_listener`].
    fn delete_status_listener(&self, tx_id: &str, listener: &mpsc::Sender<StatusEvent>);

    /// Cache the serialized token request of a transaction.
    fn cache_request(&self, tx_id: &str, request: &[u8]) -> StoreResult<()>;

    /// Cached token request, if any.
    fn get_token_request(&self, tx_id: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Store a party's acknowledgement signature of the distributed
    /// transaction.
    fn add_endorsement_ack(&self, tx_id: &str, party: &Identity, sigma: &[u8]) -> StoreResult<()>;

    /// All acknowledgements stored for `tx_id`.
    fn endorsement_acks(&self, tx_id: &str) -> StoreResult<BTreeMap<Identity, Vec<u8>>>;

    /// Every recorded transaction.
    fn transactions(&self) -> StoreResult<Vec<TransactionRecord>>;
}

// ---------------------------------------------------------------------------
// Listener fan-out
// ---------------------------------------------------------------------------

/// Per-transaction status listeners, shared by the store implementations.
#[derive(Debug, Default)]
pub struct ListenerTable {
    listeners: Mutex<HashMap<String, Vec<mpsc::Sender<StatusEvent>>>>,
}

impl ListenerTable {
    /// Add a listener for `tx_id`.
    pub fn add(&self, tx_id: &str, listener: mpsc::Sender<StatusEvent>) {
        self.listeners
            .lock()
            .entry(tx_id.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove a listener (matched by channel identity).
    pub fn remove(&self, tx_id: &str, listener: &mpsc::Sender<StatusEvent>) {
        let mut table = self.listeners.lock();
        if let Some(list) = table.get_mut(tx_id) {
            list.retain(|l| !l.same_channel(listener));
            if list.is_empty() {
                table.remove(tx_id);
            }
        }
    }

    /// Push an event to every listener of `tx_id` without blocking. A full
    /// channel means the listener already has a pending event, so the new
    /// one is dropped.
    pub fn notify(&self, tx_id: &str, status: TxStatus, message: &str) {
        let targets: Vec<_> = match self.listeners.lock().get(tx_id) {
            Some(list) => list.clone(),
            None => return,
        };
        let event = StatusEvent {
            tx_id: tx_id.to_string(),
            status,
            message: message.to_string(),
        };
        for target in targets {
            if let Err(e) = target.try_send(event.clone()) {
                debug!(tx_id = %tx_id, error = %e, "status listener did not take event");
            }
        }
    }

    /// Number of transactions with at least one listener.
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// `true` when nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// StatusCommitter
// ---------------------------------------------------------------------------

/// Ledger finality listener that writes terminal statuses into a store.
pub struct StatusCommitter {
    store: Arc<dyn StatusStore>,
}

impl StatusCommitter {
    /// Commit into `store`.
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }
}

impl FinalityListener for StatusCommitter {
    fn on_status(&self, tx_id: &str, status: TxStatus, message: &str) {
        if let Err(e) = self.store.set_status(tx_id, status, message) {
            warn!(tx_id = %tx_id, error = %e, "failed to commit finality status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TxStatus::Confirmed.is_terminal());
        assert!(TxStatus::Deleted.is_terminal());
        assert!(!TxStatus::Pending.is_terminal());
        assert!(!TxStatus::Unknown.is_terminal());
    }

    #[tokio::test]
    async fn listener_table_fans_out_and_removes() {
        let table = ListenerTable::default();
        let (tx1, mut rx1) = mpsc::channel(2);
        let (tx2, mut rx2) = mpsc::channel(2);
        table.add("t1", tx1.clone());
        table.add("t1", tx2.clone());

        table.notify("t1", TxStatus::Confirmed, "");
        assert_eq!(rx1.recv().await.unwrap().status, TxStatus::Confirmed);
        assert_eq!(rx2.recv().await.unwrap().status, TxStatus::Confirmed);

        table.remove("t1", &tx1);
        table.notify("t1", TxStatus::Deleted, "late");
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.recv().await.unwrap().message, "late");

        table.remove("t1", &tx2);
        assert!(table.is_empty());
    }

    #[test]
    fn full_listener_does_not_block() {
        let table = ListenerTable::default();
        let (tx, _rx) = mpsc::channel(1);
        table.add("t", tx);
        table.notify("t", TxStatus::Confirmed, "");
        table.notify("t", TxStatus::Confirmed, "");
    }
}
