//! # End-to-End Tests
//!
//! Integration tests that run several parties in one process over a shared
//! [`SessionHub`] and an in-memory ledger. Each party serves its inbox with
//! [`serve`], exactly as a node would.
//!
//! ## Test Categories
//!
//! - **Endorsement**: multi-party signature collection, auditing, acks
//! - **Failure Paths**: unreachable signers and auditors
//! - **Self Audit**: an auditor endorsing its own transaction
//! - **Identity Exchange**: recipient requests and withdrawals
//! - **Finality**: determinism, timeouts and rejected transactions
//! - **Selection**: concurrent locking and unlocking

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokenflow_protocol::config::{AuditLimits, FinalityConfig};
use tokenflow_protocol::identity::{Identity, Wallet, WalletRegistry};
use tokenflow_protocol::ledger::MemoryLedger;
use tokenflow_protocol::storage::{MemoryStatusStore, TxStatus};
use tokenflow_protocol::ttx::collect::ActionTransfer;
use tokenflow_protocol::ttx::finality::{get_finality, Role};
use tokenflow_protocol::ttx::ordering::{ordering, ordering_and_finality};
use tokenflow_protocol::ttx::recipients::{exchange_recipient_identities, request_recipient_identity};
use tokenflow_protocol::ttx::withdrawal::request_withdrawal;
use tokenflow_protocol::ttx::{
    collect_actions, collect_endorsements, serve, AuditorService, EndorseOptions, ErrorKind,
    Infrastructure, PartyContext, TmsId, Transaction, TxOptions,
};
use tokenflow_protocol::vault::{TokenId, UnspentToken};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Party {
    ctx: Arc<PartyContext>,
    wallet: Arc<Wallet>,
    server: JoinHandle<()>,
}

impl Party {
    fn id(&self) -> Identity {
        self.ctx.me().clone()
    }

    fn balance(&self, token_type: &str) -> u64 {
        let wallet = self.wallet.clone();
        self.ctx.vault().balance(move |id| wallet.contains(id), token_type)
    }

    fn stop(&self) {
        self.ctx.shutdown();
        self.server.abort();
    }
}

fn tms() -> TmsId {
    TmsId::new("testnet", "ch", "tokens")
}

fn setup() -> (Infrastructure, MemoryLedger) {
    let infra = Infrastructure::default();
    let ledger = MemoryLedger::new("testnet", "ch", infra.vault.clone());
    infra.networks.register(Arc::new(ledger.clone()));
    (infra, ledger)
}

fn finality_config() -> FinalityConfig {
    FinalityConfig {
        polling_interval: Duration::from_millis(20),
        default_timeout: Duration::from_secs(5),
        max_timeout: Duration::from_secs(10),
    }
}

fn party(infra: &Infrastructure, name: &str, auditor: Option<&Party>) -> Party {
    let wallets = Arc::new(WalletRegistry::new());
    let wallet = wallets.create_wallet(name);
    let mut builder = PartyContext::builder(infra, wallets).finality_config(finality_config());
    if let Some(auditor) = auditor {
        builder = builder.auditor_key(auditor.id().public_key().unwrap());
    }
    let ctx = builder.build().unwrap();
    let server = serve(ctx.clone());
    Party { ctx, wallet, server }
}

fn auditor_party(infra: &Infrastructure, name: &str) -> Party {
    let wallets = Arc::new(WalletRegistry::new());
    let wallet = wallets.create_wallet(name);
    let service = AuditorService::new(
        wallet.clone(),
        Arc::new(MemoryStatusStore::new()),
        infra.networks.clone(),
        AuditLimits::default(),
    );
    let ctx = PartyContext::builder(infra, wallets)
        .auditor(service)
        .finality_config(finality_config())
        .build()
        .unwrap();
    let server = serve(ctx.clone());
    Party { ctx, wallet, server }
}

fn fund(infra: &Infrastructure, owner: &Party, anchor: &str, quantity: u64) {
    infra
        .vault
        .add(UnspentToken::new(
            TokenId::new(anchor, 0),
            owner.wallet.identity(),
            "USD",
            quantity,
        ))
        .unwrap();
}

/// Alice pays 30 and Bob pays 20 to a fresh identity of Carol, in one
/// transaction assembled by Alice and audited by `auditor`.
async fn two_payer_transfer(
    alice: &Party,
    bob: &Party,
    carol: &Party,
    auditor: &Party,
    options: TxOptions,
) -> Transaction {
    let carol_data = request_recipient_identity(&alice.ctx, &carol.id(), &tms(), "")
        .await
        .unwrap();
    let mut tx = Transaction::new(&alice.id(), tms(), options.with_auditor(auditor.id()));
    collect_actions(
        &alice.ctx,
        &mut tx,
        &[
            ActionTransfer {
                from: alice.wallet.identity(),
                token_type: "USD".to_string(),
                amount: 30,
                recipient: carol_data.identity.clone(),
            },
            ActionTransfer {
                from: bob.wallet.identity(),
                token_type: "USD".to_string(),
                amount: 20,
                recipient: carol_data.identity.clone(),
            },
        ],
    )
    .await
    .unwrap();
    tx
}

// ---------------------------------------------------------------------------
// Endorsement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_senders_one_receiver_with_auditor() {
    let (infra, ledger) = setup();
    let auditor = auditor_party(&infra, "auditor");
    let alice = party(&infra, "alice", Some(&auditor));
    let bob = party(&infra, "bob", Some(&auditor));
    let carol = party(&infra, "carol", Some(&auditor));
    fund(&infra, &alice, "genesis-a", 100);
    fund(&infra, &bob, "genesis-b", 100);

    let mut tx = two_payer_transfer(&alice, &bob, &carol, &auditor, TxOptions::default()).await;
    assert_eq!(tx.request().actions.len(), 2);

    collect_endorsements(&alice.ctx, &mut tx, EndorseOptions::default())
        .await
        .unwrap();

    let signers = tx.request().signatures.keys().cloned().collect::<Vec<_>>();
    assert!(signers.contains(&alice.wallet.identity()));
    assert!(signers.contains(&bob.wallet.identity()));
    assert_eq!(tx.request().auditor_signatures.len(), 1);
    assert!(tx.envelope().is_some());

    // Bob, Carol and the auditor acknowledged the final transaction.
    let acks = alice.ctx.db().endorsement_acks(tx.id()).unwrap();
    assert!(acks.contains_key(&bob.id()));
    assert!(acks.contains_key(&carol.id()));
    assert!(acks.contains_key(&auditor.id()));

    ordering_and_finality(&alice.ctx, &tx, None).await.unwrap();
    assert_eq!(ledger.broadcast_count(), 1);
    assert_eq!(alice.balance("USD"), 70);
    assert_eq!(bob.balance("USD"), 80);
    assert_eq!(carol.balance("USD"), 50);

    let (status, _) = alice.ctx.db().status(tx.id()).unwrap();
    assert_eq!(status, TxStatus::Confirmed);
    let service = auditor.ctx.auditor().unwrap();
    assert!(!service.log().records_of(tx.id()).is_empty());

    for p in [&alice, &bob, &carol, &auditor] {
        p.stop();
    }
}

#[tokio::test]
async fn unreachable_signer_fails_endorsement() {
    let (infra, ledger) = setup();
    let auditor = auditor_party(&infra, "auditor");
    let alice = party(&infra, "alice", Some(&auditor));
    let bob = party(&infra, "bob", Some(&auditor));
    let carol = party(&infra, "carol", Some(&auditor));
    fund(&infra, &alice, "genesis-a", 100);
    fund(&infra, &bob, "genesis-b", 100);

    let options = TxOptions::default().with_timeout(Duration::from_millis(300));
    let mut tx = two_payer_transfer(&alice, &bob, &carol, &auditor, options).await;

    // Bob stops answering after contributing his leg.
    bob.stop();
    let err = collect_endorsements(&alice.ctx, &mut tx, EndorseOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(tx.envelope().is_none());
    assert_eq!(ledger.broadcast_count(), 0);

    assert!(tx.release(&alice.ctx) > 0);
    assert_eq!(tx.release(&alice.ctx), 0);

    for p in [&alice, &carol, &auditor] {
        p.stop();
    }
}

#[tokio::test]
async fn unreachable_auditor_fails_endorsement() {
    let (infra, ledger) = setup();
    let auditor = auditor_party(&infra, "auditor");
    let alice = party(&infra, "alice", Some(&auditor));
    let bob = party(&infra, "bob", Some(&auditor));
    let carol = party(&infra, "carol", Some(&auditor));
    fund(&infra, &alice, "genesis-a", 100);
    fund(&infra, &bob, "genesis-b", 100);

    let options = TxOptions::default().with_timeout(Duration::from_millis(300));
    let mut tx = two_payer_transfer(&alice, &bob, &carol, &auditor, options).await;

    auditor.stop();
    let err = collect_endorsements(&alice.ctx, &mut tx, EndorseOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(tx.request().auditor_signatures.is_empty());
    assert_eq!(ledger.broadcast_count(), 0);

    for p in [&alice, &bob, &carol] {
        p.stop();
    }
}

// ---------------------------------------------------------------------------
// Self Audit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn self_audit_opens_no_network_session() {
    let (infra, _ledger) = setup();
    let auditor = auditor_party(&infra, "auditor");

    let mut tx = Transaction::new(
        &auditor.id(),
        tms(),
        TxOptions::default().with_auditor(auditor.id()),
    );
    let recipient = auditor.wallet.recipient_data();
    tx.issue(&auditor.wallet.identity(), "USD", 50, &recipient)
        .unwrap();

    let opened = infra.hub.opened_sessions();
    collect_endorsements(&auditor.ctx, &mut tx, EndorseOptions::default())
        .await
        .unwrap();
    assert_eq!(infra.hub.opened_sessions(), opened);
    assert_eq!(tx.request().auditor_signatures.len(), 1);

    ordering_and_finality(&auditor.ctx, &tx, None).await.unwrap();
    assert_eq!(auditor.balance("USD"), 50);
    auditor.stop();
}

// ---------------------------------------------------------------------------
// Identity Exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recipient_request_binds_pseudonym_to_endpoint() {
    let (infra, _ledger) = setup();
    let alice = party(&infra, "alice", None);
    let bob = party(&infra, "bob", None);

    let data = request_recipient_identity(&alice.ctx, &bob.id(), &tms(), "")
        .await
        .unwrap();
    assert_ne!(data.identity, bob.id());
    assert!(bob.wallet.contains(&data.identity));
    assert_eq!(infra.hub.binder().resolve(&data.identity), bob.id());

    // A local party is answered without a session.
    let opened = infra.hub.opened_sessions();
    let own = request_recipient_identity(&alice.ctx, &alice.id(), &tms(), "")
        .await
        .unwrap();
    assert!(alice.wallet.contains(&own.identity));
    assert_eq!(infra.hub.opened_sessions(), opened);

    alice.stop();
    bob.stop();
}

#[tokio::test]
async fn exchange_teaches_both_sides() {
    let (infra, _ledger) = setup();
    let alice = party(&infra, "alice", None);
    let bob = party(&infra, "bob", None);

    let (mine, theirs) = exchange_recipient_identities(&alice.ctx, &tms(), "", &bob.id(), "")
        .await
        .unwrap();
    assert!(alice.wallet.contains(&mine.identity));
    assert!(bob.wallet.contains(&theirs.identity));
    assert_eq!(infra.hub.binder().resolve(&mine.identity), alice.id());
    assert_eq!(infra.hub.binder().resolve(&theirs.identity), bob.id());

    alice.stop();
    bob.stop();
}

#[tokio::test]
async fn withdrawal_is_paid_by_issuer() {
    let (infra, _ledger) = setup();
    let issuer = party(&infra, "issuer", None);
    let alice = party(&infra, "alice", None);
    let mut requests = issuer.ctx.subscribe_withdrawals(4);

    let sent = request_withdrawal(&alice.ctx, &issuer.id(), &tms(), "", "USD", 40, false)
        .await
        .unwrap();
    let req = tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(req.recipient_data, sent);
    assert_eq!(req.amount, 40);

    let mut tx = Transaction::new(&issuer.id(), tms(), TxOptions::default());
    tx.issue(&issuer.wallet.identity(), &req.token_type, req.amount, &req.recipient_data)
        .unwrap();
    collect_endorsements(&issuer.ctx, &mut tx, EndorseOptions::default())
        .await
        .unwrap();
    assert!(issuer
        .ctx
        .db()
        .endorsement_acks(tx.id())
        .unwrap()
        .contains_key(&alice.id()));

    ordering_and_finality(&issuer.ctx, &tx, None).await.unwrap();
    assert_eq!(alice.balance("USD"), 40);

    issuer.stop();
    alice.stop();
}

// ---------------------------------------------------------------------------
// Finality
// ---------------------------------------------------------------------------

async fn issued(issuer: &Party, quantity: u64) -> Transaction {
    let mut tx = Transaction::new(&issuer.id(), tms(), TxOptions::default());
    let recipient = issuer.wallet.recipient_data();
    tx.issue(&issuer.wallet.identity(), "USD", quantity, &recipient)
        .unwrap();
    collect_endorsements(&issuer.ctx, &mut tx, EndorseOptions::default())
        .await
        .unwrap();
    tx
}

#[tokio::test]
async fn finality_is_deterministic() {
    let (infra, _ledger) = setup();
    let issuer = party(&infra, "issuer", None);
    let tx = issued(&issuer, 10).await;

    ordering_and_finality(&issuer.ctx, &tx, None).await.unwrap();

    let start = Instant::now();
    get_finality(&issuer.ctx, &tms(), tx.id(), Role::Owner, None, None)
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    issuer.stop();
}

#[tokio::test]
async fn finality_times_out_promptly() {
    let (infra, ledger) = setup();
    ledger.set_auto_commit(false);
    let issuer = party(&infra, "issuer", None);
    let tx = issued(&issuer, 10).await;
    ordering(&issuer.ctx, &tx).await.unwrap();

    let start = Instant::now();
    let err = get_finality(
        &issuer.ctx,
        &tms(),
        tx.id(),
        Role::Owner,
        Some(Duration::from_millis(100)),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(start.elapsed() <= Duration::from_millis(500));
    issuer.stop();
}

#[tokio::test]
async fn rejected_transaction_reports_its_id() {
    let (infra, ledger) = setup();
    ledger.set_auto_commit(false);
    let issuer = party(&infra, "issuer", None);
    let tx = issued(&issuer, 10).await;
    ordering(&issuer.ctx, &tx).await.unwrap();

    let waiter = {
        let ctx = issuer.ctx.clone();
        let id = tx.id().to_string();
        tokio::spawn(async move { get_finality(&ctx, &tms(), &id, Role::Owner, None, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    ledger.set_status(tx.id(), TxStatus::Deleted, "double spend");

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FinalityInvalid);
    assert!(err.to_string().contains(tx.id()));
    assert_eq!(issuer.balance("USD"), 0);
    issuer.stop();
}

// ---------------------------------------------------------------------------
// Serialization & Selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn endorsed_transaction_survives_serialization() {
    let (infra, _ledger) = setup();
    let issuer = party(&infra, "issuer", None);
    let mut tx = issued(&issuer, 10).await;
    tx.set_transient("note", b"hello");

    let raw = tx.to_bytes().unwrap();
    let back = Transaction::from_bytes(&raw).unwrap();
    assert_eq!(back.id(), tx.id());
    assert_eq!(back.tms_id(), tx.tms_id());
    assert_eq!(back.request(), tx.request());
    assert_eq!(back.envelope(), tx.envelope());
    assert_eq!(back.get_transient("note"), Some(&b"hello"[..]));
    issuer.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_selections_never_share_a_token() {
    let (infra, _ledger) = setup();
    let alice = party(&infra, "alice", None);
    for i in 0..20 {
        fund(&infra, &alice, &format!("genesis-{i}"), 10);
    }

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let selector = alice.ctx.selector().clone();
            let owner = alice.wallet.clone();
            tokio::spawn(async move {
                let tx_id = format!("tx-{n}");
                let picked = selector
                    .select(move |id| owner.contains(id), 50, "USD", &tx_id)
                    .await;
                (tx_id, picked)
            })
        })
        .collect();

    let mut taken: Vec<(String, Vec<TokenId>)> = Vec::new();
    for handle in handles {
        let (tx_id, picked) = handle.await.unwrap();
        let (ids, sum) = picked.unwrap();
        assert!(sum >= 50);
        taken.push((tx_id, ids));
    }
    for (i, (_, a)) in taken.iter().enumerate() {
        for (_, b) in &taken[i + 1..] {
            assert!(a.iter().all(|id| !b.contains(id)));
        }
    }

    let selector = alice.ctx.selector();
    let (first_tx, first_ids) = &taken[0];
    assert_eq!(selector.unlock(first_tx), first_ids.len());
    assert_eq!(selector.unlock(first_tx), 0);
    alice.stop();
}
