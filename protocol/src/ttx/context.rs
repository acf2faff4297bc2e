//! # Party Context
//!
//! Everything a party needs to run the protocol, passed explicitly to every
//! protocol function. There is no global registry: whoever builds the
//! context decides which wallets, stores, ledgers and auditor it talks to.
//!
//! ```text
//! PartyContext
//!   me ─────────── endpoint identity (default wallet)
//!   wallets ────── WalletRegistry (local vs remote resolution)
//!   hub, inbox ─── sessions in and out
//!   networks ───── ledgers by (network, channel)
//!   vault ──────── unspent tokens
//!   selector ───── token selection + lock table
//!   db ─────────── owner TransactionDb
//!   auditor ────── AuditorService, when this party audits
//!   finality ───── FinalityManager (one service per TMS and role)
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use super::auditor::AuditorService;
use super::db::TransactionDb;
use super::error::{TtxError, TtxResult};
use super::finality::FinalityManager;
use super::transaction::Transaction;
use super::withdrawal::WithdrawalRequest;
use crate::config::{FinalityConfig, SelectorConfig, TtxConfig};
use crate::crypto::keys::{PartyKeypair, PublicKey};
use crate::identity::{Identity, WalletRegistry, WalletService};
use crate::ledger::Networks;
use crate::selector::{Locker, Selector};
use crate::session::{Inbox, SessionHub};
use crate::storage::{MemoryStatusStore, StatusStore};
use crate::vault::TokenVault;

/// Infrastructure shared by all parties of one deployment.
#[derive(Clone, Default)]
pub struct Infrastructure {
    pub hub: Arc<SessionHub>,
    pub networks: Arc<Networks>,
    pub vault: Arc<TokenVault>,
}

/// One party's view of the world.
pub struct PartyContext {
    me: Identity,
    wallets: Arc<WalletRegistry>,
    hub: Arc<SessionHub>,
    inbox: Inbox,
    networks: Arc<Networks>,
    vault: Arc<TokenVault>,
    selector: Arc<Selector>,
    db: Arc<TransactionDb>,
    auditor: Option<Arc<AuditorService>>,
    auditor_keys: Vec<PublicKey>,
    finality: FinalityManager,
    config: TtxConfig,
    selector_config: SelectorConfig,
    withdrawals: Mutex<Option<mpsc::Sender<WithdrawalRequest>>>,
    shutdown: watch::Sender<bool>,
}

impl PartyContext {
    /// Start building a party over `wallets`. The default wallet's
    /// identity becomes the endpoint identity.
    pub fn builder(infra: &Infrastructure, wallets: Arc<WalletRegistry>) -> PartyBuilder {
        PartyBuilder {
            infra: infra.clone(),
            wallets,
            store: None,
            auditor: None,
            auditor_keys: Vec::new(),
            config: TtxConfig::default(),
            finality: FinalityConfig::default(),
            selector: SelectorConfig::default(),
        }
    }

    /// Endpoint identity.
    pub fn me(&self) -> &Identity {
        &self.me
    }

    pub fn wallets(&self) -> &Arc<WalletRegistry> {
        &self.wallets
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn networks(&self) -> &Arc<Networks> {
        &self.networks
    }

    pub fn vault(&self) -> &Arc<TokenVault> {
        &self.vault
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    /// Owner transaction database.
    pub fn db(&self) -> &Arc<TransactionDb> {
        &self.db
    }

    /// The auditor service, if this party is an auditor.
    pub fn auditor(&self) -> Option<&Arc<AuditorService>> {
        self.auditor.as_ref()
    }

    /// Auditor public keys accepted by the token policy.
    pub fn auditor_keys(&self) -> &[PublicKey] {
        &self.auditor_keys
    }

    pub fn finality(&self) -> &FinalityManager {
        &self.finality
    }

    pub fn config(&self) -> &TtxConfig {
        &self.config
    }

    /// Reply timeout for interactive rounds on `tx`.
    pub fn session_timeout(&self, tx: &Transaction) -> Duration {
        tx.options().timeout.unwrap_or(self.config.session_timeout)
    }

    /// Key signing acknowledgements as this endpoint.
    pub fn endpoint_signer(&self) -> TtxResult<PartyKeypair> {
        Ok(self.wallets.signer(&self.me)?)
    }

    /// Receive withdrawal requests addressed to this party. Replaces any
    /// previous subscriber.
    pub fn subscribe_withdrawals(&self, capacity: usize) -> mpsc::Receiver<WithdrawalRequest> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.withdrawals.lock() = Some(tx);
        rx
    }

    pub(crate) fn withdrawal_sink(&self) -> Option<mpsc::Sender<WithdrawalRequest>> {
        self.withdrawals.lock().clone()
    }

    /// Shutdown signal shared by the party's background tasks.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Start lock eviction. Finality pollers start lazily.
    pub fn start_background(&self) -> JoinHandle<()> {
        self.selector
            .locker()
            .spawn_eviction(self.selector_config.eviction_interval, self.shutdown_signal())
    }

    /// Stop every background task of this party.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.finality.stop_all();
        info!(party = %self.me, "party shut down");
    }
}

/// Builder for [`PartyContext`].
pub struct PartyBuilder {
    infra: Infrastructure,
    wallets: Arc<WalletRegistry>,
    store: Option<Arc<dyn StatusStore>>,
    auditor: Option<AuditorService>,
    auditor_keys: Vec<PublicKey>,
    config: TtxConfig,
    finality: FinalityConfig,
    selector: SelectorConfig,
}

impl PartyBuilder {
    /// Owner status store. Defaults to an in-memory one.
    pub fn status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Make this party an auditor.
    pub fn auditor(mut self, service: AuditorService) -> Self {
        self.auditor = Some(service);
        self
    }

    /// Accept signatures from this auditor key.
    pub fn auditor_key(mut self, key: PublicKey) -> Self {
        self.auditor_keys.push(key);
        self
    }

    pub fn ttx_config(mut self, config: TtxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn finality_config(mut self, config: FinalityConfig) -> Self {
        self.finality = config;
        self
    }

    pub fn selector_config(mut self, config: SelectorConfig) -> Self {
        self.selector = config;
        self
    }

    /// Register the endpoint on the hub and assemble the context.
    pub fn build(self) -> TtxResult<Arc<PartyContext>> {
        let me = self.wallets.default_wallet()?.identity();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStatusStore::new()) as Arc<dyn StatusStore>);

        let locker = Arc::new(Locker::new(
            store.clone(),
            self.selector.confirmed_lock_timeout,
        ));
        let selector = Arc::new(Selector::new(
            self.infra.vault.clone(),
            locker,
            self.selector.clone(),
        ));
        let db = Arc::new(TransactionDb::new(store, self.infra.networks.clone()));

        let mut auditor_keys = self.auditor_keys;
        let auditor = self.auditor.map(Arc::new);
        let auditor_store = match &auditor {
            Some(service) => {
                let pk = service.identity().public_key()?;
                if !auditor_keys.contains(&pk) {
                    auditor_keys.push(pk);
                }
                Some(service.db().store().clone())
            }
            None => None,
        };
        if me.is_none() {
            return Err(TtxError::InvalidInput("party has no endpoint identity".to_string()));
        }

        let finality = FinalityManager::new(db.store().clone(), auditor_store, self.finality);
        let inbox = self.infra.hub.register(&me);
        if let Some(service) = &auditor {
            let auditor_id = service.identity();
            if auditor_id != me {
                self.infra.hub.bind(&me, &auditor_id);
            }
        }
        let (shutdown, _) = watch::channel(false);
        info!(party = %me, auditor = auditor.is_some(), "party ready");

        Ok(Arc::new(PartyContext {
            me,
            wallets: self.wallets,
            hub: self.infra.hub,
            inbox,
            networks: self.infra.networks,
            vault: self.infra.vault,
            selector,
            db,
            auditor,
            auditor_keys,
            finality,
            config: self.config,
            selector_config: self.selector,
            withdrawals: Mutex::new(None),
            shutdown,
        }))
    }
}
