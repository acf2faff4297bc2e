//! # SledStatusStore: Persistent Status Storage
//!
//! A [`StatusStore`] on top of sled's embedded key-value store, so a party
//! remembers its transactions (and their finality) across restarts.
//!
//! ## Tree Layout
//!
//! | Tree           | Key                          | Value                        |
//! |----------------|------------------------------|------------------------------|
//! | `transactions` | `tx_id` (UTF-8)              | `bincode(TransactionRecord)` |
//! | `requests`     | `tx_id` (UTF-8)              | raw token request bytes      |
//! | `acks`         | `tx_id` `0x00` `identity`    | raw ack signature            |
//!
//! The `0x00` separator keeps all acks of a transaction in one contiguous
//! key range, so `endorsement_acks` is a single prefix scan.
//!
//! Listeners are process-local and live in memory next to the trees.

use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::mpsc;

use super::{
    ListenerTable, StatusEntry, StatusEvent, StatusStore, StoreError, StoreResult,
    TransactionRecord, TxStatus,
};
use crate::identity::Identity;

/// Persistent status store.
#[derive(Debug)]
pub struct SledStatusStore {
    db: Db,
    transactions: Tree,
    requests: Tree,
    acks: Tree,
    listeners: ListenerTable,
}

impl SledStatusStore {
    /// Open or create a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// A store that lives in a temporary location and is removed on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            transactions: db.open_tree("transactions")?,
            requests: db.open_tree("requests")?,
            acks: db.open_tree("acks")?,
            db,
            listeners: ListenerTable::default(),
        })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn get_record(&self, tx_id: &str) -> StoreResult<Option<TransactionRecord>> {
        match self.transactions.get(tx_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_record(&self, record: &TransactionRecord) -> StoreResult<()> {
        self.transactions
            .insert(record.tx_id.as_bytes(), encode(record)?)?;
        Ok(())
    }
}

fn encode(record: &TransactionRecord) -> StoreResult<Vec<u8>> {
    bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> StoreResult<TransactionRecord> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn ack_prefix(tx_id: &str) -> Vec<u8> {
    let mut key = tx_id.as_bytes().to_vec();
    key.push(0x00);
    key
}

impl StatusStore for SledStatusStore {
    fn append_transaction(&self, tx_id: &str) -> StoreResult<()> {
        if self.get_record(tx_id)?.is_none() {
            self.put_record(&TransactionRecord::pending(tx_id))?;
        }
        Ok(())
    }

    fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) -> StoreResult<()> {
        let mut record = self
            .get_record(tx_id)?
            .unwrap_or_else(|| TransactionRecord::pending(tx_id));
        record.status = status;
        record.message = message.to_string();
        self.put_record(&record)?;
        self.listeners.notify(tx_id, status, message);
        Ok(())
    }

    fn get_status(&self, tx_id: &str) -> StoreResult<(TxStatus, String)> {
        Ok(self
            .get_record(tx_id)?
            .map(|r| (r.status, r.message))
            .unwrap_or((TxStatus::Unknown, String::new())))
    }

    fn get_statuses(&self, tx_ids: &[String]) -> StoreResult<Vec<StatusEntry>> {
        tx_ids
            .iter()
            .map(|id| {
                let (status, message) = self.get_status(id)?;
                Ok(StatusEntry {
                    tx_id: id.clone(),
                    status,
                    message,
                })
            })
            .collect()
    }

    fn add_status_listener(&self, tx_id: &str, listener: mpsc::Sender<StatusEvent>) {
        self.listeners.add(tx_id, listener);
    }

    fn delete_status_listener(&self, tx_id: &str, listener: &mpsc::Sender<StatusEvent>) {
        self.listeners.remove(tx_id, listener);
    }

    fn cache_request(&self, tx_id: &str, request: &[u8]) -> StoreResult<()> {
        self.requests.insert(tx_id.as_bytes(), request)?;
        Ok(())
    }

    fn get_token_request(&self, tx_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.requests.get(tx_id.as_bytes())?.map(|v| v.to_vec()))
    }

    fn add_endorsement_ack(&self, tx_id: &str, party: &Identity, sigma: &[u8]) -> StoreResult<()> {
        let mut key = ack_prefix(tx_id);
        key.extend_from_slice(party.as_bytes());
        self.acks.insert(key, sigma)?;
        Ok(())
    }

    fn endorsement_acks(&self, tx_id: &str) -> StoreResult<BTreeMap<Identity, Vec<u8>>> {
        let prefix = ack_prefix(tx_id);
        let mut out = BTreeMap::new();
        for item in self.acks.scan_prefix(&prefix) {
            let (key, value) = item?;
            out.insert(Identity::from_bytes(&key[prefix.len()..]), value.to_vec());
        }
        Ok(out)
    }

    fn transactions(&self) -> StoreResult<Vec<TransactionRecord>> {
        let mut out = Vec::new();
        for item in self.transactions.iter() {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.tx_id.cmp(&b.tx_id)));
        Ok(out)
    }
}
