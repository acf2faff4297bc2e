//! # In-Process Simulation
//!
//! Runs a complete token flow between five parties sharing one process:
//!
//! ```text
//!  alice ──withdraw──► issuer ──issue──► alice      (audited)
//!  bob   ──withdraw──► issuer ──issue──► bob        (audited)
//!  alice + bob ──────transfer────────► carol        (audited)
//! ```
//!
//! Every party serves its inbox on the shared hub, so each step crosses
//! real sessions exactly as separate nodes would.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use tokenflow_protocol::crypto::PublicKey;
use tokenflow_protocol::identity::{Wallet, WalletRegistry};
use tokenflow_protocol::ledger::MemoryLedger;
use tokenflow_protocol::storage::MemoryStatusStore;
use tokenflow_protocol::ttx::{
    collect_actions, collect_endorsements, ordering_and_finality, request_recipient_identity,
    request_withdrawal, serve, ActionTransfer, AuditorService, EndorseOptions, Infrastructure,
    PartyContext, Transaction, TxOptions,
};

use crate::config::NodeConfig;
use crate::metrics::TransactionMetrics;

/// Outcome printed by `simulate`.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub transactions: Vec<String>,
    pub balances: Vec<(String, u64)>,
    pub broadcasts: u64,
    pub audit_records: usize,
}

struct SimParty {
    name: &'static str,
    ctx: Arc<PartyContext>,
    wallet: Arc<Wallet>,
    server: JoinHandle<()>,
}

impl SimParty {
    fn balance(&self, token_type: &str) -> u64 {
        let wallet = self.wallet.clone();
        self.ctx.vault().balance(move |id| wallet.contains(id), token_type)
    }

    fn stop(self) {
        self.ctx.shutdown();
        self.server.abort();
    }
}

fn spawn_party(
    infra: &Infrastructure,
    cfg: &NodeConfig,
    name: &'static str,
    auditor_key: Option<PublicKey>,
) -> Result<SimParty> {
    let wallets = Arc::new(WalletRegistry::new());
    let wallet = wallets.create_wallet(name);
    let mut builder = PartyContext::builder(infra, wallets)
        .ttx_config(cfg.ttx.clone())
        .finality_config(cfg.finality.clone())
        .selector_config(cfg.selector.clone());
    if let Some(key) = auditor_key {
        builder = builder.auditor_key(key);
    }
    let ctx = builder
        .build()
        .with_context(|| format!("failed to build party {name}"))?;
    let server = serve(ctx.clone());
    Ok(SimParty { name, ctx, wallet, server })
}

fn spawn_auditor(infra: &Infrastructure, cfg: &NodeConfig) -> Result<SimParty> {
    let wallets = Arc::new(WalletRegistry::new());
    let wallet = wallets.create_wallet("auditor");
    let service = AuditorService::new(
        wallet.clone(),
        Arc::new(MemoryStatusStore::new()),
        infra.networks.clone(),
        cfg.audit.clone(),
    );
    let ctx = PartyContext::builder(infra, wallets)
        .auditor(service)
        .ttx_config(cfg.ttx.clone())
        .finality_config(cfg.finality.clone())
        .build()
        .context("failed to build auditor")?;
    let server = serve(ctx.clone());
    Ok(SimParty { name: "auditor", ctx, wallet, server })
}

/// Run the scenario with `issue` tokens per sender and `pay` from each
/// sender to the recipient.
pub async fn run(
    cfg: &NodeConfig,
    metrics: &TransactionMetrics,
    token_type: &str,
    issue: u64,
    pay: u64,
) -> Result<SimulationReport> {
    let infra = Infrastructure::default();
    let ledger = MemoryLedger::new(&cfg.network, &cfg.channel, infra.vault.clone());
    infra.networks.register(Arc::new(ledger.clone()));

    let auditor = spawn_auditor(&infra, cfg)?;
    let auditor_id = auditor.ctx.me().clone();
    let auditor_key = auditor_id.public_key()?;
    let issuer = spawn_party(&infra, cfg, "issuer", Some(auditor_key.clone()))?;
    let alice = spawn_party(&infra, cfg, "alice", Some(auditor_key.clone()))?;
    let bob = spawn_party(&infra, cfg, "bob", Some(auditor_key.clone()))?;
    let carol = spawn_party(&infra, cfg, "carol", Some(auditor_key))?;

    let tms = cfg.tms_id();
    let options = TxOptions::default().with_auditor(auditor_id);
    let mut transactions = Vec::new();

    // Withdrawals: the issuer pays whatever arrives on its channel.
    let mut requests = issuer.ctx.subscribe_withdrawals(4);
    for sender in [&alice, &bob] {
        request_withdrawal(&sender.ctx, issuer.ctx.me(), &tms, "", token_type, issue, false)
            .await
            .with_context(|| format!("{} failed to request withdrawal", sender.name))?;
        let req = requests
            .recv()
            .await
            .ok_or_else(|| anyhow!("withdrawal channel closed"))?;

        let started = Instant::now();
        let mut tx = Transaction::new(issuer.ctx.me(), tms.clone(), options.clone());
        tx.issue(issuer.ctx.me(), &req.token_type, req.amount, &req.recipient_data)?;
        finish(&issuer.ctx, &mut tx, metrics, started).await?;
        transactions.push(tx.id().to_string());
    }

    // One transfer, two payers.
    let started = Instant::now();
    let recipient = request_recipient_identity(&alice.ctx, carol.ctx.me(), &tms, "").await?;
    let mut tx = Transaction::new(alice.ctx.me(), tms.clone(), options.clone());
    let legs = [&alice, &bob].map(|payer| ActionTransfer {
        from: payer.wallet.identity(),
        token_type: token_type.to_string(),
        amount: pay,
        recipient: recipient.identity.clone(),
    });
    collect_actions(&alice.ctx, &mut tx, &legs).await?;
    if let Err(e) = finish(&alice.ctx, &mut tx, metrics, started).await {
        tx.release(&alice.ctx);
        return Err(e);
    }
    transactions.push(tx.id().to_string());

    let parties = [issuer, alice, bob, carol];
    let balances = parties
        .iter()
        .map(|p| (p.name.to_string(), p.balance(token_type)))
        .collect();
    let audit_records = auditor.ctx.auditor().map(|s| s.log().len()).unwrap_or(0);

    for p in parties {
        p.stop();
    }
    auditor.stop();

    Ok(SimulationReport {
        transactions,
        balances,
        broadcasts: ledger.broadcast_count(),
        audit_records,
    })
}

async fn finish(
    ctx: &Arc<PartyContext>,
    tx: &mut Transaction,
    metrics: &TransactionMetrics,
    started: Instant,
) -> Result<()> {
    let outcome = async {
        collect_endorsements(ctx, tx, EndorseOptions::default()).await?;
        metrics.endorsed_total.inc();
        ordering_and_finality(ctx, tx, None).await
    }
    .await;
    match outcome {
        Ok(()) => {
            metrics.confirmed_total.inc();
            metrics
                .latency_seconds
                .observe(started.elapsed().as_secs_f64());
            tracing::info!(tx_id = %tx.id(), "transaction final");
            Ok(())
        }
        Err(e) => {
            metrics.failed_total.inc();
            Err(anyhow!(e).context(format!("transaction {} failed", tx.id())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn scenario_moves_funds_to_recipient() {
        let mut cfg = NodeConfig::default();
        cfg.finality.polling_interval = Duration::from_millis(20);
        let metrics = crate::metrics::NodeMetrics::new()
            .unwrap()
            .register_transactions()
            .unwrap();

        let report = run(&cfg, &metrics, "USD", 100, 25).await.unwrap();
        assert_eq!(report.transactions.len(), 3);
        assert_eq!(report.broadcasts, 3);
        assert!(report.audit_records > 0);

        let balance = |name: &str| {
            report
                .balances
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, b)| *b)
                .unwrap()
        };
        assert_eq!(balance("alice"), 75);
        assert_eq!(balance("bob"), 75);
        assert_eq!(balance("carol"), 50);
        assert_eq!(balance("issuer"), 0);
        assert_eq!(metrics.confirmed_total.get(), 3);
        assert_eq!(metrics.failed_total.get(), 0);
    }

    #[tokio::test]
    async fn audit_limit_rejects_large_payment() {
        let mut cfg = NodeConfig::default();
        cfg.audit.payment_limit = 10;
        let metrics = crate::metrics::NodeMetrics::new()
            .unwrap()
            .register_transactions()
            .unwrap();

        let err = run(&cfg, &metrics, "USD", 100, 25).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
        assert_eq!(metrics.confirmed_total.get(), 2);
        assert_eq!(metrics.failed_total.get(), 1);
    }
}
