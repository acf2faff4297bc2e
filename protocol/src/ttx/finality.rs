//! # Finality Service
//!
//! Answers "was transaction T confirmed or rejected?" with low latency in
//! the common case and a fixed background cost under load.
//!
//! ```text
//! get_finality(T)
//!   1. status store ── Confirmed → Ok
//!                   ── Deleted   → FinalityInvalid
//!                   ── Unknown   → UnknownTransaction
//!                   ── Pending   ↓
//!   2. add status listener (fast path) + pending entry (fallback)
//!   3. select! { cancel → Cancelled, timer → Timeout, event → resolve }
//!   4. remove listener and entry
//!
//! poller, every polling_interval:
//!   ids = pending keys
//!   one get_statuses(ids) ── terminal → push event, drop entry
//!                        ── otherwise → budget -= 1, drop entry at 0
//! ```
//!
//! The poller issues one batched query per tick no matter how many
//! transactions are pending. A failing query is logged and retried on the
//! next tick; it never fails a waiter.
//!
//! Owners and auditors keep separate status stores, so the
//! [`FinalityManager`] runs one service per `(TmsId, Role)`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::PartyContext;
use super::error::{TtxError, TtxResult};
use super::transaction::TmsId;
use crate::config::{FinalityConfig, STATUS_EVENT_CAPACITY};
use crate::storage::{StatusEvent, StatusStore, TxStatus};

// ---------------------------------------------------------------------------
// Pending table
// ---------------------------------------------------------------------------

struct PendingEntry {
    waiters: Vec<mpsc::Sender<StatusEvent>>,
    remaining: u32,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingEntry>>>;

// ---------------------------------------------------------------------------
// FinalityService
// ---------------------------------------------------------------------------

/// Finality tracking over one status store.
pub struct FinalityService {
    store: Arc<dyn StatusStore>,
    config: FinalityConfig,
    pending: PendingTable,
    poller: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl FinalityService {
    pub fn new(store: Arc<dyn StatusStore>, config: FinalityConfig) -> Self {
        Self {
            store,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            poller: Mutex::new(None),
        }
    }

    /// Start the polling task. Starting twice is a no-op.
    pub fn start(&self) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(
            self.store.clone(),
            self.pending.clone(),
            self.config.polling_interval,
            rx,
        ));
        *poller = Some((tx, handle));
    }

    /// Signal the polling task to stop. Waiters keep their listeners and
    /// timers.
    pub fn stop(&self) {
        if let Some((tx, _handle)) = self.poller.lock().take() {
            let _ = tx.send(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller.lock().is_some()
    }

    /// Transactions currently tracked by the poller.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait until `tx_id` is final.
    ///
    /// `timeout` defaults to the configured one and is clamped to the
    /// configured maximum. `cancel` aborts the wait as soon as it turns
    /// `true`.
    pub async fn get_finality(
        &self,
        tx_id: &str,
        timeout: Option<Duration>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> TtxResult<()> {
        match self.store.get_status(tx_id)? {
            (TxStatus::Pending, _) => {}
            (status, message) => return resolve(tx_id, status, &message),
        }

        let timeout = self.config.effective_timeout(timeout);
        let (tx, mut rx) = mpsc::channel(STATUS_EVENT_CAPACITY);
        self.store.add_status_listener(tx_id, tx.clone());
        {
            let budget = self.config.iterations_for(timeout);
            let mut pending = self.pending.lock();
            let entry = pending.entry(tx_id.to_string()).or_insert_with(|| PendingEntry {
                waiters: Vec::new(),
                remaining: budget,
            });
            entry.waiters.push(tx.clone());
            entry.remaining = entry.remaining.max(budget);
        }
        debug!(tx_id = %tx_id, timeout_ms = timeout.as_millis() as u64, "waiting for finality");

        // The status may have moved between the first read and the
        // listener registration.
        let outcome = match self.store.get_status(tx_id) {
            Ok((TxStatus::Pending, _)) | Err(_) => {
                tokio::select! {
                    biased;
                    _ = cancelled(cancel) => {
                        Err(TtxError::Cancelled(format!("finality wait for [{}] cancelled", tx_id)))
                    }
                    _ = tokio::time::sleep(timeout) => {
                        Err(TtxError::Timeout(format!(
                            "transaction [{}] not final after {}ms",
                            tx_id,
                            timeout.as_millis()
                        )))
                    }
                    event = rx.recv() => match event {
                        Some(ev) => resolve(tx_id, ev.status, &ev.message),
                        None => Err(TtxError::Cancelled(format!("status listener for [{}] closed", tx_id))),
                    },
                }
            }
            Ok((status, message)) => resolve(tx_id, status, &message),
        };

        self.store.delete_status_listener(tx_id, &tx);
        {
            let mut pending = self.pending.lock();
            if let Some(entry) = pending.get_mut(tx_id) {
                entry.waiters.retain(|w| !w.same_channel(&tx));
                if entry.waiters.is_empty() {
                    pending.remove(tx_id);
                }
            }
        }
        outcome
    }
}

impl Drop for FinalityService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve(tx_id: &str, status: TxStatus, message: &str) -> TtxResult<()> {
    match status {
        TxStatus::Confirmed => Ok(()),
        TxStatus::Deleted => Err(TtxError::FinalityInvalid {
            tx_id: tx_id.to_string(),
            message: message.to_string(),
        }),
        TxStatus::Unknown => Err(TtxError::UnknownTransaction(tx_id.to_string())),
        TxStatus::Pending => Err(TtxError::InvalidInput(format!(
            "transaction [{}] is still pending",
            tx_id
        ))),
    }
}

async fn cancelled(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut cancel) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone without cancelling: never fires.
            return std::future::pending().await;
        }
    }
}

async fn poll_loop(
    store: Arc<dyn StatusStore>,
    pending: PendingTable,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "finality poller started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        poll_once(store.as_ref(), &pending);
    }
    info!("finality poller stopped");
}

fn poll_once(store: &dyn StatusStore, pending: &PendingTable) {
    let ids: Vec<String> = pending.lock().keys().cloned().collect();
    if ids.is_empty() {
        return;
    }
    let statuses = match store.get_statuses(&ids) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(pending = ids.len(), error = %e, "finality poll failed, retrying next tick");
            Vec::new()
        }
    };
    let resolved: HashMap<String, (TxStatus, String)> = statuses
        .into_iter()
        .filter(|row| row.status.is_terminal())
        .map(|row| (row.tx_id, (row.status, row.message)))
        .collect();

    let mut table = pending.lock();
    for id in ids {
        let Some(entry) = table.get_mut(&id) else {
            continue;
        };
        if let Some((status, message)) = resolved.get(&id) {
            let event = StatusEvent {
                tx_id: id.clone(),
                status: *status,
                message: message.clone(),
            };
            for w in &entry.waiters {
                let _ = w.try_send(event.clone());
            }
            debug!(tx_id = %id, status = %status, "poller resolved transaction");
            table.remove(&id);
            continue;
        }
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining == 0 {
            debug!(tx_id = %id, "poll budget exhausted, dropping entry");
            table.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// FinalityManager
// ---------------------------------------------------------------------------

/// Which status store backs a finality service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Owner,
    Auditor,
}

/// Lazily created finality services, one per `(TmsId, Role)`.
pub struct FinalityManager {
    owner: Arc<dyn StatusStore>,
    auditor: Option<Arc<dyn StatusStore>>,
    config: FinalityConfig,
    services: Mutex<HashMap<(TmsId, Role), Arc<FinalityService>>>,
}

impl FinalityManager {
    pub fn new(
        owner: Arc<dyn StatusStore>,
        auditor: Option<Arc<dyn StatusStore>>,
        config: FinalityConfig,
    ) -> Self {
        Self {
            owner,
            auditor,
            config,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// The running service for `tms_id` and `role`.
    pub fn service(&self, tms_id: &TmsId, role: Role) -> TtxResult<Arc<FinalityService>> {
        let mut services = self.services.lock();
        if let Some(s) = services.get(&(tms_id.clone(), role)) {
            return Ok(s.clone());
        }
        let store = match role {
            Role::Owner => self.owner.clone(),
            Role::Auditor => self.auditor.clone().ok_or_else(|| {
                TtxError::InvalidInput("this party has no auditor status store".to_string())
            })?,
        };
        let service = Arc::new(FinalityService::new(store, self.config.clone()));
        service.start();
        debug!(tms = %tms_id, role = ?role, "finality service started");
        services.insert((tms_id.clone(), role), service.clone());
        Ok(service)
    }

    /// Stop every service.
    pub fn stop_all(&self) {
        for s in self.services.lock().values() {
            s.stop();
        }
    }
}

/// Wait for finality of `tx_id` as seen by this party in `role`.
pub async fn get_finality(
    ctx: &PartyContext,
    tms_id: &TmsId,
    tx_id: &str,
    role: Role,
    timeout: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
) -> TtxResult<()> {
    ctx.finality()
        .service(tms_id, role)?
        .get_finality(tx_id, timeout, cancel)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStatusStore;
    use std::time::Instant;

    fn service(store: Arc<MemoryStatusStore>, poll_ms: u64) -> FinalityService {
        let config = FinalityConfig {
            polling_interval: Duration::from_millis(poll_ms),
            ..FinalityConfig::default()
        };
        let s = FinalityService::new(store, config);
        s.start();
        s
    }

    #[tokio::test]
    async fn immediate_results() {
        let store = Arc::new(MemoryStatusStore::new());
        let s = service(store.clone(), 20);
        store.set_status("ok", TxStatus::Confirmed, "").unwrap();
        store.set_status("bad", TxStatus::Deleted, "double spend").unwrap();

        s.get_finality("ok", None, None).await.unwrap();
        let err = s.get_finality("bad", None, None).await.unwrap_err();
        assert!(matches!(err, TtxError::FinalityInvalid { ref tx_id, .. } if tx_id == "bad"));
        assert!(matches!(
            s.get_finality("nobody", None, None).await,
            Err(TtxError::UnknownTransaction(_))
        ));
    }

    #[tokio::test]
    async fn listener_resolves_pending() {
        let store = Arc::new(MemoryStatusStore::new());
        let s = Arc::new(service(store.clone(), 10_000));
        store.append_transaction("t").unwrap();

        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.get_finality("t", Some(Duration::from_secs(5)), None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(s.pending_count(), 1);
        store.set_status("t", TxStatus::Confirmed, "").unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(s.pending_count(), 0);
        assert_eq!(store.listener_count(), 0);
    }

    /// Store that never delivers listener events, so only the poller can
    /// resolve a waiter.
    struct DeafStore(MemoryStatusStore);

    impl StatusStore for DeafStore {
        fn append_transaction(&self, tx_id: &str) -> crate::storage::StoreResult<()> {
            self.0.append_transaction(tx_id)
        }
        fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) -> crate::storage::StoreResult<()> {
            self.0.set_status(tx_id, status, message)
        }
        fn get_status(&self, tx_id: &str) -> crate::storage::StoreResult<(TxStatus, String)> {
            self.0.get_status(tx_id)
        }
        fn get_statuses(&self, tx_ids: &[String]) -> crate::storage::StoreResult<Vec<crate::storage::StatusEntry>> {
            self.0.get_statuses(tx_ids)
        }
        fn add_status_listener(&self, _tx_id: &str, _listener: mpsc::Sender<StatusEvent>) {}
        fn delete_status_listener(&self, _tx_id: &str, _listener: &mpsc::Sender<StatusEvent>) {}
        fn cache_request(&self, tx_id: &str, request: &[u8]) -> crate::storage::StoreResult<()> {
            self.0.cache_request(tx_id, request)
        }
        fn get_token_request(&self, tx_id: &str) -> crate::storage::StoreResult<Option<Vec<u8>>> {
            self.0.get_token_request(tx_id)
        }
        fn add_endorsement_ack(
            &self,
            tx_id: &str,
            party: &crate::identity::Identity,
            sigma: &[u8],
        ) -> crate::storage::StoreResult<()> {
            self.0.add_endorsement_ack(tx_id, party, sigma)
        }
        fn endorsement_acks(
            &self,
            tx_id: &str,
        ) -> crate::storage::StoreResult<std::collections::BTreeMap<crate::identity::Identity, Vec<u8>>> {
            self.0.endorsement_acks(tx_id)
        }
        fn transactions(&self) -> crate::storage::StoreResult<Vec<crate::storage::TransactionRecord>> {
            self.0.transactions()
        }
    }

    #[tokio::test]
    async fn poller_resolves_without_listener_event() {
        let store = Arc::new(DeafStore(MemoryStatusStore::new()));
        let config = FinalityConfig {
            polling_interval: Duration::from_millis(10),
            ..FinalityConfig::default()
        };
        let s = Arc::new(FinalityService::new(store.clone(), config));
        s.start();
        store.append_transaction("t").unwrap();

        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.get_finality("t", Some(Duration::from_secs(5)), None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set_status("t", TxStatus::Deleted, "late").unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TtxError::FinalityInvalid { ref message, .. } if message == "late"));
        assert!(store.0.batch_queries() >= 1);
    }

    #[tokio::test]
    async fn times_out_within_margin() {
        let store = Arc::new(MemoryStatusStore::new());
        let s = service(store.clone(), 20);
        store.append_transaction("stuck").unwrap();
        let started = Instant::now();
        let err = s
            .get_finality("stuck", Some(Duration::from_millis(100)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TtxError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(s.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let store = Arc::new(MemoryStatusStore::new());
        let s = service(store.clone(), 20);
        store.append_transaction("t").unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = cancel_tx.send(true);
        });
        let err = s
            .get_finality("t", Some(Duration::from_secs(5)), Some(cancel_rx))
            .await
            .unwrap_err();
        assert!(matches!(err, TtxError::Cancelled(_)));
    }

    #[tokio::test]
    async fn poll_failures_do_not_fail_waiters() {
        let store = Arc::new(MemoryStatusStore::new());
        let s = Arc::new(service(store.clone(), 5));
        store.append_transaction("t").unwrap();
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.get_finality("t", Some(Duration::from_secs(5)), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set_unavailable(false);
        store.set_status("t", TxStatus::Confirmed, "").unwrap();
        waiter.await.unwrap().unwrap();
        assert!(store.batch_queries() > 1);
    }

    #[test]
    fn poll_once_drops_exhausted_entries() {
        let store = MemoryStatusStore::new();
        store.append_transaction("t").unwrap();
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = mpsc::channel(1);
        pending.lock().insert(
            "t".to_string(),
            PendingEntry {
                waiters: vec![tx],
                remaining: 2,
            },
        );
        poll_once(&store, &pending);
        assert_eq!(pending.lock().len(), 1);
        poll_once(&store, &pending);
        assert!(pending.lock().is_empty());
        assert_eq!(store.batch_queries(), 2);
    }

    #[tokio::test]
    async fn manager_shares_services_per_tms_and_role() {
        let owner = Arc::new(MemoryStatusStore::new());
        let m = FinalityManager::new(owner, None, FinalityConfig::default());
        let tms = TmsId::new("n", "c", "ns");
        let a = m.service(&tms, Role::Owner).unwrap();
        let b = m.service(&tms, Role::Owner).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(m.service(&tms, Role::Auditor).is_err());
        m.stop_all();
        assert!(!a.is_running());
    }
}
