//! In-memory [`StatusStore`]. Everything lives in `parking_lot` tables and
//! disappears with the process.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::{
    ListenerTable, StatusEntry, StatusEvent, StatusStore, StoreError, StoreResult,
    TransactionRecord, TxStatus,
};
use crate::identity::Identity;

/// Volatile status store.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<String, TransactionRecord>>,
    requests: RwLock<HashMap<String, Vec<u8>>>,
    acks: RwLock<HashMap<String, BTreeMap<Identity, Vec<u8>>>>,
    listeners: ListenerTable,
    unavailable: AtomicBool,
    batch_queries: AtomicU64,
}

impl MemoryStatusStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every query fail with [`StoreError::Unavailable`] until reset.
    /// Writes keep working.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of [`StatusStore::get_statuses`] calls served so far.
    pub fn batch_queries(&self) -> u64 {
        self.batch_queries.load(Ordering::SeqCst)
    }

    /// Number of transactions with a registered listener.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("status store offline".to_string()));
        }
        Ok(())
    }
}

impl StatusStore for MemoryStatusStore {
    fn append_transaction(&self, tx_id: &str) -> StoreResult<()> {
        self.records
            .write()
            .entry(tx_id.to_string())
            .or_insert_with(|| TransactionRecord::pending(tx_id));
        Ok(())
    }

    fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) -> StoreResult<()> {
        {
            let mut records = self.records.write();
            let record = records
                .entry(tx_id.to_string())
                .or_insert_with(|| TransactionRecord::pending(tx_id));
            record.status = status;
            record.message = message.to_string();
        }
        self.listeners.notify(tx_id, status, message);
        Ok(())
    }

    fn get_status(&self, tx_id: &str) -> StoreResult<(TxStatus, String)> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .get(tx_id)
            .map(|r| (r.status, r.message.clone()))
            .unwrap_or((TxStatus::Unknown, String::new())))
    }

    fn get_statuses(&self, tx_ids: &[String]) -> StoreResult<Vec<StatusEntry>> {
        self.batch_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let records = self.records.read();
        Ok(tx_ids
            .iter()
            .map(|id| match records.get(id) {
                Some(r) => StatusEntry {
                    tx_id: id.clone(),
                    status: r.status,
                    message: r.message.clone(),
                },
                None => StatusEntry {
                    tx_id: id.clone(),
                    status: TxStatus::Unknown,
                    message: String::new(),
                },
            })
            .collect())
    }

    fn add_status_listener(&self, tx_id: &str, listener: mpsc::Sender<StatusEvent>) {
        self.listeners.add(tx_id, listener);
    }

    fn delete_status_listener(&self, tx_id: &str, listener: &mpsc::Sender<StatusEvent>) {
        self.listeners.remove(tx_id, listener);
    }

    fn cache_request(&self, tx_id: &str, request: &[u8]) -> StoreResult<()> {
        self.requests
            .write()
            .insert(tx_id.to_string(), request.to_vec());
        Ok(())
    }

    fn get_token_request(&self, tx_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.requests.read().get(tx_id).cloned())
    }

    fn add_endorsement_ack(&self, tx_id: &str, party: &Identity, sigma: &[u8]) -> StoreResult<()> {
        self.acks
            .write()
            .entry(tx_id.to_string())
            .or_default()
            .insert(party.clone(), sigma.to_vec());
        Ok(())
    }

    fn endorsement_acks(&self, tx_id: &str) -> StoreResult<BTreeMap<Identity, Vec<u8>>> {
        Ok(self.acks.read().get(tx_id).cloned().unwrap_or_default())
    }

    fn transactions(&self) -> StoreResult<Vec<TransactionRecord>> {
        let mut out: Vec<_> = self.records.read().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.tx_id.cmp(&b.tx_id)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_until_appended() {
        let store = MemoryStatusStore::new();
        assert_eq!(store.get_status("t").unwrap().0, TxStatus::Unknown);
        store.append_transaction("t").unwrap();
        assert_eq!(store.get_status("t").unwrap().0, TxStatus::Pending);
    }

    #[test]
    fn append_does_not_reset_status() {
        let store = MemoryStatusStore::new();
        store.append_transaction("t").unwrap();
        store.set_status("t", TxStatus::Confirmed, "").unwrap();
        store.append_transaction("t").unwrap();
        assert_eq!(store.get_status("t").unwrap().0, TxStatus::Confirmed);
    }

    #[test]
    fn batched_statuses_keep_input_order() {
        let store = MemoryStatusStore::new();
        store.append_transaction("a").unwrap();
        store.set_status("b", TxStatus::Deleted, "double spend").unwrap();
        let rows = store
            .get_statuses(&["b".to_string(), "zzz".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(rows[0].status, TxStatus::Deleted);
        assert_eq!(rows[0].message, "double spend");
        assert_eq!(rows[1].status, TxStatus::Unknown);
        assert_eq!(rows[2].status, TxStatus::Pending);
        assert_eq!(store.batch_queries(), 1);
    }

    #[test]
    fn unavailable_store_fails_queries() {
        let store = MemoryStatusStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get_status("x"), Err(StoreError::Unavailable(_))));
        assert!(store.get_statuses(&["x".to_string()]).is_err());
        store.set_unavailable(false);
        assert!(store.get_status("x").is_ok());
    }

    #[tokio::test]
    async fn set_status_notifies_listener() {
        let store = MemoryStatusStore::new();
        let (tx, mut rx) = mpsc::channel(2);
        store.add_status_listener("t", tx.clone());
        store.set_status("t", TxStatus::Confirmed, "").unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.tx_id, "t");
        assert_eq!(ev.status, TxStatus::Confirmed);
        store.delete_status_listener("t", &tx);
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn acks_and_request_cache() {
        let store = MemoryStatusStore::new();
        let party = Identity::from_bytes(vec![1]);
        store.add_endorsement_ack("t", &party, b"sig").unwrap();
        assert_eq!(store.endorsement_acks("t").unwrap()[&party], b"sig".to_vec());
        assert_eq!(store.get_token_request("t").unwrap(), None);
        store.cache_request("t", b"req").unwrap();
        assert_eq!(store.get_token_request("t").unwrap(), Some(b"req".to_vec()));
    }
}
