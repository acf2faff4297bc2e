//! # Auditing
//!
//! An auditor co-signs every transaction of a token namespace after
//! checking it against its own history of token movements.
//!
//! ```text
//! initiator                                  auditor
//!   │ Opening::Audit { tx }                     │
//!   ├──────────────────────────────────────────►│ checks ── fail ──► error reply
//!   │                                           │ append audit records
//!   │                                           │ append tx (Pending)
//!   │               AuditResponse { signature } │ sign marshal_to_sign
//!   │◄──────────────────────────────────────────┤
//!   │ verify against auditor keys               │
//!   │ ... ledger approval ...                   │
//!   │ Distribution { final tx }                 │
//!   ├──────────────────────────────────────────►│ store envelope
//!   │                           Ack { sigma }   │
//!   │◄──────────────────────────────────────────┤
//! ```
//!
//! When the initiator is itself the auditor, the session is an in-process
//! channel pair whose far end is served by the local [`AuditorService`].
//! No hub session is opened in that case.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::PartyContext;
use super::endorse::{Ack, EndorseMessage};
use super::error::{StageExt, TtxError, TtxResult};
use super::responder::{serve_session, Opening};
use super::transaction::Transaction;
use crate::config::AuditLimits;
use crate::crypto::keys::Signature;
use crate::identity::{Identity, Wallet};
use crate::ledger::Networks;
use crate::session::{receive_json, send_json, ChannelSession, Session, SessionKind};
use crate::storage::{AuditLog, AuditRecord, Direction, StatusStore, TxStatus};

use super::db::TransactionDb;

/// Auditor reply carrying its signature over the token request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuditResponse {
    pub signature: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// A policy the auditor enforces before signing.
pub trait AuditCheck: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// `Err(reason)` refuses the transaction. `records` are the movements
    /// the transaction would add to `log`.
    fn check(&self, tx: &Transaction, records: &[AuditRecord], log: &AuditLog) -> Result<(), String>;
}

/// Payment, cumulative-payment and holding limits per enrollment ID.
pub struct LimitCheck {
    limits: AuditLimits,
}

impl LimitCheck {
    pub fn new(limits: AuditLimits) -> Self {
        Self { limits }
    }
}

impl AuditCheck for LimitCheck {
    fn name(&self) -> &str {
        "limits"
    }

    fn check(&self, _tx: &Transaction, records: &[AuditRecord], log: &AuditLog) -> Result<(), String> {
        let l = &self.limits;
        for r in records {
            match r.direction {
                Direction::Outbound => {
                    if r.amount > l.payment_limit {
                        return Err(format!(
                            "payment of {} {} by [{}] exceeds the limit of {}",
                            r.amount, r.token_type, r.enrollment_id, l.payment_limit
                        ));
                    }
                    let window = l.cumulative_window.saturating_sub(1);
                    let recent: u64 = log
                        .payments(&r.enrollment_id, &r.token_type, window)
                        .iter()
                        .sum();
                    if recent.saturating_add(r.amount) > l.cumulative_limit {
                        return Err(format!(
                            "cumulative payments of [{}] would reach {} {}, limit is {}",
                            r.enrollment_id,
                            recent.saturating_add(r.amount),
                            r.token_type,
                            l.cumulative_limit
                        ));
                    }
                }
                Direction::Inbound => {
                    let holding = log.holding(&r.enrollment_id, &r.token_type);
                    if holding.saturating_add(r.amount) > l.holding_limit {
                        return Err(format!(
                            "holding of [{}] would reach {} {}, limit is {}",
                            r.enrollment_id,
                            holding.saturating_add(r.amount),
                            r.token_type,
                            l.holding_limit
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Net movement per `(enrollment, token type)` and action. Change that
/// flows back to a spender cancels out against its inputs.
pub fn audit_records(tx: &Transaction) -> TtxResult<Vec<AuditRecord>> {
    let mut records = Vec::new();
    for action in &tx.request().actions {
        let mut net: BTreeMap<(String, String), i128> = BTreeMap::new();
        for input in action.inputs() {
            let key = (input.enrollment_id()?, input.token_type.clone());
            *net.entry(key).or_default() -= i128::from(input.quantity);
        }
        for output in action.outputs() {
            if output.owner.is_none() {
                continue;
            }
            let key = (output.enrollment_id()?, output.token_type.clone());
            *net.entry(key).or_default() += i128::from(output.quantity);
        }
        for ((eid, token_type), amount) in net {
            let (direction, amount) = match amount {
                a if a > 0 => (Direction::Inbound, a),
                a if a < 0 => (Direction::Outbound, -a),
                _ => continue,
            };
            let amount = u64::try_from(amount)
                .map_err(|_| TtxError::InvalidInput("audited amount overflows".to_string()))?;
            records.push(AuditRecord::new(tx.id(), &eid, &token_type, amount, direction));
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// AuditorService
// ---------------------------------------------------------------------------

/// Auditor state: signing wallet, audit status store and movement log.
pub struct AuditorService {
    wallet: Arc<Wallet>,
    db: Arc<TransactionDb>,
    log: Arc<AuditLog>,
    checks: Vec<Arc<dyn AuditCheck>>,
}

impl AuditorService {
    /// An auditor signing with `wallet`'s default key, recording into
    /// `store` and enforcing `limits`.
    pub fn new(
        wallet: Arc<Wallet>,
        store: Arc<dyn StatusStore>,
        networks: Arc<Networks>,
        limits: AuditLimits,
    ) -> Self {
        let log = Arc::new(AuditLog::new());
        let db = TransactionDb::new(store, networks).with_listener(log.clone());
        Self {
            wallet,
            db: Arc::new(db),
            log,
            checks: vec![Arc::new(LimitCheck::new(limits))],
        }
    }

    /// Add a check after the default ones.
    pub fn with_check(mut self, check: Arc<dyn AuditCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Identity the auditor signs as.
    pub fn identity(&self) -> Identity {
        self.wallet.identity()
    }

    /// Audit transaction database.
    pub fn db(&self) -> &Arc<TransactionDb> {
        &self.db
    }

    pub fn log(&self) -> &Arc<AuditLog> {
        &self.log
    }

    /// Run every check and return the records the transaction adds.
    pub fn check(&self, tx: &Transaction) -> TtxResult<Vec<AuditRecord>> {
        let records = audit_records(tx)?;
        for c in &self.checks {
            c.check(tx, &records, &self.log)
                .map_err(|reason| TtxError::AuditCheck(format!("{}: {}", c.name(), reason)))?;
        }
        Ok(records)
    }

    fn sign(&self, message: &[u8]) -> TtxResult<Signature> {
        let id = self.identity();
        let kp = self
            .wallet
            .signer(&id)
            .ok_or(crate::identity::WalletError::NotMine(id))?;
        Ok(kp.sign(message))
    }

    /// Mark the movements of an abandoned audit as rejected. A later
    /// ledger verdict overrides this.
    fn abandon(&self, tx_id: &str) {
        use crate::ledger::FinalityListener;
        self.log.on_status(tx_id, TxStatus::Deleted, "audit abandoned");
    }
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

/// The open session with the auditor, kept until the final transaction is
/// distributed.
pub struct AuditSession {
    pub(crate) session: Arc<dyn Session>,
    pub(crate) auditor: Identity,
}

impl AuditSession {
    pub fn auditor(&self) -> &Identity {
        &self.auditor
    }

    pub fn is_self_session(&self) -> bool {
        self.session.info().kind == SessionKind::SelfLoop
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

/// Ask the transaction's auditor for its signature and attach it.
pub async fn audit(ctx: &Arc<PartyContext>, tx: &mut Transaction) -> TtxResult<AuditSession> {
    let auditor = tx
        .options()
        .auditor
        .clone()
        .ok_or_else(|| TtxError::InvalidInput("no auditor configured".to_string()))?;

    let local = ctx
        .auditor()
        .map(|service| service.identity() == auditor)
        .unwrap_or(false);
    let session: Arc<dyn Session> = if local {
        let (mine, theirs) = ChannelSession::self_pair(ctx.me());
        tokio::spawn(serve_session(ctx.clone(), Arc::new(theirs)));
        debug!(tx_id = %tx.id(), "auditing through self session");
        Arc::new(mine)
    } else {
        ctx.hub()
            .open(ctx.me(), &auditor)
            .await
            .stage("failed to open session to auditor")?
    };

    match request_audit_signature(ctx, tx, session.as_ref()).await {
        Ok(()) => Ok(AuditSession { session, auditor }),
        Err(e) => {
            session.close().await;
            Err(e)
        }
    }
}

async fn request_audit_signature(
    ctx: &PartyContext,
    tx: &mut Transaction,
    session: &dyn Session,
) -> TtxResult<()> {
    let raw = tx.to_bytes()?;
    send_json(session, &Opening::Audit { raw })
        .await
        .stage("failed to send transaction to auditor")?;
    let resp: AuditResponse = receive_json(session, ctx.session_timeout(tx))
        .await
        .stage("failed to receive auditor signature")?;

    let message = tx.request().marshal_to_sign()?;
    let signature = Signature::from_vec(resp.signature);
    let key = ctx
        .auditor_keys()
        .iter()
        .find(|pk| pk.verify(&message, &signature))
        .ok_or_else(|| {
            TtxError::InvalidSignature(format!("auditor signature on [{}] does not verify", tx.id()))
        })?;
    tx.request_mut()
        .auditor_signatures
        .insert(Identity::from_public_key(key), signature.into_vec());
    info!(tx_id = %tx.id(), "auditor signature attached");
    Ok(())
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Audit, sign, then wait for the final transaction and acknowledge it.
pub async fn audit_approve(
    ctx: &PartyContext,
    service: &AuditorService,
    session: &dyn Session,
    raw: &[u8],
) -> TtxResult<()> {
    let tx = match Transaction::from_bytes(raw) {
        Ok(tx) => tx,
        Err(e) => {
            warn!(error = %e, "audit refused, undecodable transaction");
            if let Err(se) = session.send_error(&e.to_string()).await {
                warn!(error = %se, "failed to report audit failure");
            }
            return Err(e);
        }
    };
    let records = match tx.validate().and_then(|_| service.check(&tx)) {
        Ok(records) => records,
        Err(e) => {
            warn!(tx_id = %tx.id(), error = %e, "audit refused");
            if let Err(se) = session.send_error(&e.to_string()).await {
                warn!(error = %se, "failed to report audit failure");
            }
            return Err(e);
        }
    };

    service.log.append(tx.id(), records);
    let result = approve_and_ack(ctx, service, session, &tx).await;
    if let Err(e) = &result {
        service.abandon(tx.id());
        if let Err(se) = session.send_error(&e.to_string()).await {
            debug!(error = %se, "failed to report audit failure");
        }
    }
    result
}

async fn approve_and_ack(
    ctx: &PartyContext,
    service: &AuditorService,
    session: &dyn Session,
    tx: &Transaction,
) -> TtxResult<()> {
    service.db.append(tx).stage("failed to append audited transaction")?;
    let signature = service.sign(&tx.request().marshal_to_sign()?)?;
    send_json(
        session,
        &AuditResponse {
            signature: signature.into_vec(),
        },
    )
    .await
    .stage("failed to send audit signature")?;
    debug!(tx_id = %tx.id(), "audit signature sent");

    let msg: EndorseMessage = receive_json(session, ctx.config().session_timeout)
        .await
        .stage("failed to receive final transaction")?;
    let EndorseMessage::Distribution(dist) = msg else {
        return Err(TtxError::InvalidInput(
            "auditor expected the final transaction".to_string(),
        ));
    };
    let final_tx = Transaction::from_bytes(&dist.raw)?;
    if final_tx.id() != tx.id() {
        return Err(TtxError::SignerMismatch(format!(
            "final transaction [{}] does not match audited [{}]",
            final_tx.id(),
            tx.id()
        )));
    }
    if final_tx.request().marshal_to_sign()? != tx.request().marshal_to_sign()? {
        return Err(TtxError::SignerMismatch(format!(
            "final request of [{}] differs from the audited one",
            tx.id()
        )));
    }
    let envelope = final_tx
        .envelope()
        .ok_or_else(|| TtxError::InvalidInput(format!("final transaction [{}] has no envelope", tx.id())))?;
    envelope.verify()?;
    let ledger = ctx
        .networks()
        .get(&tx.tms_id().network, &tx.tms_id().channel)?;
    ledger.store_envelope(tx.id(), &envelope.to_bytes()?)?;

    let sigma = service
        .sign(&dist.raw)
        .stage("failed to sign ack response")?;
    send_json(
        session,
        &Ack {
            signature: sigma.into_vec(),
        },
    )
    .await
    .stage("failed to send ack")?;
    info!(tx_id = %tx.id(), "audit completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RecipientData;
    use crate::ttx::transaction::{TmsId, TxOptions};

    #[tokio::test]
    async fn undecodable_audit_request_is_refused() {
        use crate::identity::WalletRegistry;
        use crate::session::{receive_raw, SessionError};
        use crate::storage::MemoryStatusStore;
        use crate::ttx::context::Infrastructure;
        use std::time::Duration;

        let infra = Infrastructure::default();
        let wallets = Arc::new(WalletRegistry::new());
        let wallet = wallets.create_wallet("auditor");
        let service = AuditorService::new(
            wallet,
            Arc::new(MemoryStatusStore::new()),
            infra.networks.clone(),
            AuditLimits::default(),
        );
        let ctx = PartyContext::builder(&infra, wallets)
            .auditor(service)
            .build()
            .unwrap();
        let (initiator, responder) = ChannelSession::pair(
            "audit-1".to_string(),
            Identity::from_bytes(vec![9; 32]),
            ctx.me().clone(),
            SessionKind::Network,
        );

        let service = ctx.auditor().unwrap();
        assert!(audit_approve(&ctx, service, &responder, b"not a transaction")
            .await
            .is_err());
        let reply = receive_raw(&initiator, Duration::from_millis(200)).await;
        assert!(matches!(reply, Err(SessionError::Remote(_))));
        assert!(service.log().is_empty());
    }

    fn issue_tx(issuer: &Wallet, to: &RecipientData, amount: u64) -> Transaction {
        let mut tx = Transaction::new(&issuer.identity(), TmsId::new("n", "c", "ns"), TxOptions::default());
        tx.issue(&issuer.identity(), "USD", amount, to).unwrap();
        tx
    }

    #[test]
    fn issue_produces_inbound_record() {
        let issuer = Wallet::new("issuer");
        let alice = Wallet::new("alice");
        let tx = issue_tx(&issuer, &alice.recipient_data(), 50);
        let records = audit_records(&tx).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].enrollment_id, "alice");
        assert_eq!(records[0].direction, Direction::Inbound);
        assert_eq!(records[0].amount, 50);
    }

    #[test]
    fn payment_limit_is_enforced() {
        let check = LimitCheck::new(AuditLimits::default());
        let log = AuditLog::new();
        let issuer = Wallet::new("issuer");
        let tx = issue_tx(&issuer, &Wallet::new("a").recipient_data(), 1);
        let too_big = vec![AuditRecord::new("t", "alice", "USD", 201, Direction::Outbound)];
        assert!(check.check(&tx, &too_big, &log).is_err());
        let ok = vec![AuditRecord::new("t", "alice", "USD", 200, Direction::Outbound)];
        assert!(check.check(&tx, &ok, &log).is_ok());
    }

    #[test]
    fn cumulative_limit_counts_previous_payments() {
        let limits = AuditLimits {
            cumulative_limit: 300,
            cumulative_window: 3,
            ..AuditLimits::default()
        };
        let check = LimitCheck::new(limits);
        let log = AuditLog::new();
        log.append("p1", vec![AuditRecord::new("p1", "alice", "USD", 150, Direction::Outbound)]);
        log.append("p2", vec![AuditRecord::new("p2", "alice", "USD", 100, Direction::Outbound)]);
        let issuer = Wallet::new("issuer");
        let tx = issue_tx(&issuer, &Wallet::new("a").recipient_data(), 1);
        let next = vec![AuditRecord::new("t", "alice", "USD", 60, Direction::Outbound)];
        assert!(check.check(&tx, &next, &log).is_err());
        let next = vec![AuditRecord::new("t", "alice", "USD", 50, Direction::Outbound)];
        assert!(check.check(&tx, &next, &log).is_ok());
    }

    #[test]
    fn holding_limit_is_enforced() {
        let check = LimitCheck::new(AuditLimits::default());
        let log = AuditLog::new();
        log.append("i1", vec![AuditRecord::new("i1", "bob", "USD", 2_900, Direction::Inbound)]);
        let issuer = Wallet::new("issuer");
        let tx = issue_tx(&issuer, &Wallet::new("a").recipient_data(), 1);
        let more = vec![AuditRecord::new("t", "bob", "USD", 101, Direction::Inbound)];
        let err = check.check(&tx, &more, &log).unwrap_err();
        assert!(err.contains("holding"));
    }

    #[test]
    fn service_refuses_over_limit_issue() {
        let networks = Arc::new(Networks::new());
        let store: Arc<dyn StatusStore> = Arc::new(crate::storage::MemoryStatusStore::new());
        let service = AuditorService::new(
            Arc::new(Wallet::new("auditor")),
            store,
            networks,
            AuditLimits::default(),
        );
        let issuer = Wallet::new("issuer");
        let tx = issue_tx(&issuer, &Wallet::new("alice").recipient_data(), 5_000);
        let err = service.check(&tx).unwrap_err();
        assert_eq!(err.kind(), crate::ttx::error::ErrorKind::InvalidInput);
        assert!(service.log().is_empty());
    }
}
