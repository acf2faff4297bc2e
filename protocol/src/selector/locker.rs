//! # Token Lock Table
//!
//! Maps every reserved token to the transaction holding it. One mutex
//! guards the whole table: lookups, inserts and deletes all go through it,
//! so "check then lock" can never interleave with another selector.
//!
//! A lock outlives a crashed or abandoned protocol run unless something
//! removes it. Two things do:
//!
//! - **reclaim**: a selector retrying after contention may take over a lock
//!   whose holder transaction the status store reports as `Deleted`;
//! - **eviction**: a background scan drops locks whose holder is `Deleted`,
//!   `Confirmed` for longer than the confirmed-lock timeout, or whose
//!   status cannot be read at all.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SelectorError;
use crate::storage::{StatusStore, TxStatus};
use crate::vault::TokenId;

#[derive(Debug, Clone)]
struct LockEntry {
    tx_id: String,
    created: Instant,
    last_access: Instant,
}

/// Token lock table.
pub struct Locker {
    locks: Mutex<HashMap<TokenId, LockEntry>>,
    statuses: Arc<dyn StatusStore>,
    confirmed_timeout: Duration,
}

impl Locker {
    /// A lock table consulting `statuses` for the state of holder
    /// transactions.
    pub fn new(statuses: Arc<dyn StatusStore>, confirmed_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            statuses,
            confirmed_timeout,
        }
    }

    /// Reserve `id` for `tx_id`.
    ///
    /// Locking a token already held by the same transaction only refreshes
    /// it. A token held by another transaction is taken over only when
    /// `reclaim` is set and the holder is `Deleted`.
    pub fn lock(&self, id: &TokenId, tx_id: &str, reclaim: bool) -> Result<(), SelectorError> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some(entry) = locks.get_mut(id) {
            if entry.tx_id == tx_id {
                entry.last_access = now;
                return Ok(());
            }
            let holder_deleted = reclaim
                && matches!(
                    self.statuses.get_status(&entry.tx_id),
                    Ok((TxStatus::Deleted, _))
                );
            if !holder_deleted {
                entry.last_access = now;
                return Err(SelectorError::AlreadyLocked {
                    token: id.clone(),
                    holder: entry.tx_id.clone(),
                });
            }
            debug!(token = %id, from = %entry.tx_id, to = %tx_id, "reclaiming lock of deleted transaction");
        }
        locks.insert(
            id.clone(),
            LockEntry {
                tx_id: tx_id.to_string(),
                created: now,
                last_access: now,
            },
        );
        Ok(())
    }

    /// Release the given tokens. Returns the ones that were not locked.
    pub fn unlock_ids(&self, ids: &[TokenId]) -> Vec<TokenId> {
        let mut locks = self.locks.lock();
        ids.iter()
            .filter(|id| locks.remove(*id).is_none())
            .cloned()
            .collect()
    }

    /// Release every token held by `tx_id`. Safe to repeat; returns how
    /// many locks were released by this call.
    pub fn unlock_by_tx_id(&self, tx_id: &str) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, e| e.tx_id != tx_id);
        let released = before - locks.len();
        if released > 0 {
            debug!(tx_id = %tx_id, released, "unlocked tokens");
        }
        released
    }

    /// Transaction holding `id`, if any.
    pub fn holder(&self, id: &TokenId) -> Option<String> {
        self.locks.lock().get(id).map(|e| e.tx_id.clone())
    }

    /// Tokens held by `tx_id`, sorted.
    pub fn locked_by(&self, tx_id: &str) -> Vec<TokenId> {
        let mut ids: Vec<_> = self
            .locks
            .lock()
            .iter()
            .filter(|(_, e)| e.tx_id == tx_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One eviction pass. Returns the number of evicted locks.
    pub fn scan_once(&self) -> usize {
        let mut locks = self.locks.lock();
        if locks.is_empty() {
            return 0;
        }
        let now = Instant::now();
        let before = locks.len();
        locks.retain(|id, entry| {
            let evict = match self.statuses.get_status(&entry.tx_id) {
                Ok((TxStatus::Deleted, _)) => true,
                Ok((TxStatus::Confirmed, _)) => {
                    now.duration_since(entry.last_access) > self.confirmed_timeout
                }
                Ok(_) => false,
                Err(e) => {
                    warn!(token = %id, tx_id = %entry.tx_id, error = %e, "cannot read holder status, evicting lock");
                    true
                }
            };
            if evict {
                debug!(
                    token = %id,
                    tx_id = %entry.tx_id,
                    age_ms = now.duration_since(entry.created).as_millis() as u64,
                    "evicting lock"
                );
            }
            !evict
        });
        before - locks.len()
    }

    /// Run [`Locker::scan_once`] every `interval` until `shutdown` fires.
    pub fn spawn_eviction(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let locker = self.clone();
        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "lock eviction started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                let evicted = locker.scan_once();
                if evicted > 0 {
                    info!(evicted, remaining = locker.len(), "evicted stale token locks");
                }
            }
            info!("lock eviction stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStatusStore;

    fn setup() -> (Arc<MemoryStatusStore>, Locker) {
        let store = Arc::new(MemoryStatusStore::new());
        let locker = Locker::new(store.clone(), Duration::from_millis(50));
        (store, locker)
    }

    #[test]
    fn second_transaction_cannot_lock() {
        let (_, locker) = setup();
        let id = TokenId::new("g", 0);
        locker.lock(&id, "t1", false).unwrap();
        locker.lock(&id, "t1", false).unwrap();
        let err = locker.lock(&id, "t2", true).unwrap_err();
        assert!(matches!(err, SelectorError::AlreadyLocked { ref holder, .. } if holder == "t1"));
    }

    #[test]
    fn reclaim_only_from_deleted_holder() {
        let (store, locker) = setup();
        let id = TokenId::new("g", 0);
        locker.lock(&id, "t1", false).unwrap();
        store.set_status("t1", TxStatus::Deleted, "").unwrap();
        assert!(locker.lock(&id, "t2", false).is_err());
        locker.lock(&id, "t2", true).unwrap();
        assert_eq!(locker.holder(&id).as_deref(), Some("t2"));
    }

    #[test]
    fn unlock_by_tx_id_is_idempotent() {
        let (_, locker) = setup();
        locker.lock(&TokenId::new("g", 0), "t1", false).unwrap();
        locker.lock(&TokenId::new("g", 1), "t1", false).unwrap();
        locker.lock(&TokenId::new("g", 2), "t2", false).unwrap();
        assert_eq!(locker.unlock_by_tx_id("t1"), 2);
        assert_eq!(locker.unlock_by_tx_id("t1"), 0);
        assert_eq!(locker.len(), 1);
    }

    #[test]
    fn unlock_ids_reports_unknown() {
        let (_, locker) = setup();
        locker.lock(&TokenId::new("g", 0), "t1", false).unwrap();
        let missing = locker.unlock_ids(&[TokenId::new("g", 0), TokenId::new("g", 9)]);
        assert_eq!(missing, vec![TokenId::new("g", 9)]);
        assert!(locker.is_empty());
    }

    #[test]
    fn scan_evicts_deleted_and_old_confirmed() {
        let (store, locker) = setup();
        store.append_transaction("pending").unwrap();
        store.set_status("deleted", TxStatus::Deleted, "").unwrap();
        store.set_status("confirmed", TxStatus::Confirmed, "").unwrap();
        locker.lock(&TokenId::new("a", 0), "pending", false).unwrap();
        locker.lock(&TokenId::new("b", 0), "deleted", false).unwrap();
        locker.lock(&TokenId::new("c", 0), "confirmed", false).unwrap();

        assert_eq!(locker.scan_once(), 1);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(locker.scan_once(), 1);
        assert_eq!(locker.locked_by("pending"), vec![TokenId::new("a", 0)]);
    }

    #[test]
    fn scan_evicts_when_store_fails() {
        let (store, locker) = setup();
        store.append_transaction("t").unwrap();
        locker.lock(&TokenId::new("a", 0), "t", false).unwrap();
        store.set_unavailable(true);
        assert_eq!(locker.scan_once(), 1);
    }

    #[tokio::test]
    async fn eviction_task_stops_on_shutdown() {
        let store = Arc::new(MemoryStatusStore::new());
        let locker = Arc::new(Locker::new(store.clone(), Duration::from_secs(60)));
        store.set_status("t", TxStatus::Deleted, "").unwrap();
        locker.lock(&TokenId::new("a", 0), "t", false).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = locker.spawn_eviction(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(locker.is_empty());
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
