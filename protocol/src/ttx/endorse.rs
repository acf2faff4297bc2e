//! # Endorsement Collection
//!
//! The central signature round. The initiator gathers a signature from
//! every required signer, has the auditor co-sign, obtains the ledger's
//! approval and finally hands the finished transaction to every party
//! involved, collecting a signed acknowledgement from each.
//!
//! ```text
//! initiator                                 remote party (per endpoint)
//!   validate, append (Pending)
//!   │ Opening::Transaction { tx }              │
//!   ├─────────────────────────────────────────►│ append (Pending)
//!   │ signatures, per required signer:         │
//!   │   skip list ─► external ─► local wallet  │
//!   │   ─► remote:                             │
//!   │ SignatureRequest { tx_id, req, signer }  │
//!   ├─────────────────────────────────────────►│ signer mine? req equal?
//!   │                SignatureResponse { sig } │
//!   │◄─────────────────────────────────────────┤
//!   │ verify                                   │
//!   audit (if configured)
//!   ledger approval ─► envelope
//!   │ Distribution { final tx }                │
//!   ├─────────────────────────────────────────►│ same request? envelope ok?
//!   │                            Ack { sigma } │ cache request
//!   │◄─────────────────────────────────────────┤
//!   verify + store acks, close sessions
//! ```
//!
//! Remote endpoints are served concurrently. Sessions are closed on every
//! exit path.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::auditor::{audit, AuditSession};
use super::context::PartyContext;
use super::error::{StageExt, TtxError, TtxResult};
use super::external::ExternalWalletSigner;
use super::responder::Opening;
use super::transaction::Transaction;
use crate::crypto::keys::Signature;
use crate::identity::{Identity, WalletService};
use crate::session::{receive_json, send_json, Session};

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Ask an endpoint to sign the token request as `signer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignatureRequest {
    #[serde(rename = "TxID")]
    pub tx_id: String,
    /// The bytes to sign; must equal the responder's own
    /// `marshal_to_sign`.
    pub request: Vec<u8>,
    pub signer: Identity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignatureResponse {
    pub signature: Vec<u8>,
}

/// The finished transaction, envelope included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Distribution {
    pub raw: Vec<u8>,
}

/// Signature of the receiving endpoint over [`Distribution::raw`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ack {
    pub signature: Vec<u8>,
}

/// What the initiator sends once a transaction session is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Body")]
pub enum EndorseMessage {
    SignatureRequest(SignatureRequest),
    Distribution(Distribution),
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-round overrides of how signatures are obtained.
#[derive(Clone, Default)]
pub struct EndorseOptions {
    /// Signatures supplied up front. They are verified, never requested.
    pub skip_signatures: BTreeMap<Identity, Vec<u8>>,
    /// Signers whose keys live in an external wallet.
    pub external_signers: HashMap<Identity, Arc<dyn ExternalWalletSigner>>,
}

impl EndorseOptions {
    pub fn skip_signature(mut self, signer: Identity, signature: Vec<u8>) -> Self {
        self.skip_signatures.insert(signer, signature);
        self
    }

    pub fn external_signer(mut self, signer: Identity, ext: Arc<dyn ExternalWalletSigner>) -> Self {
        self.external_signers.insert(signer, ext);
        self
    }
}

fn verify_signature(signer: &Identity, message: &[u8], signature: &[u8]) -> TtxResult<()> {
    if signer.verify(message, &Signature::from_vec(signature.to_vec())) {
        Ok(())
    } else {
        Err(TtxError::InvalidSignature(format!("signature of [{}] does not verify", signer)))
    }
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

struct Peer {
    endpoint: Identity,
    session: Arc<dyn Session>,
    signers: Vec<Identity>,
}

/// Collect every signature `tx` needs, the auditor's included, then get
/// the ledger envelope and distribute the final transaction.
pub async fn collect_endorsements(
    ctx: &Arc<PartyContext>,
    tx: &mut Transaction,
    opts: EndorseOptions,
) -> TtxResult<()> {
    tx.validate().stage("transaction is not valid")?;
    ctx.db()
        .append(tx)
        .stage("failed to append transaction")?;

    let peers = open_peer_sessions(ctx, tx, &opts).await?;
    let mut audit_session = None;
    let result = endorse(ctx, tx, &opts, &peers, &mut audit_session).await;

    for peer in &peers {
        if result.is_err() {
            if let Err(e) = peer.session.send_error("endorsement aborted").await {
                debug!(peer = %peer.endpoint, error = %e, "failed to notify peer");
            }
        }
        peer.session.close().await;
    }
    if let Some(s) = &audit_session {
        s.close().await;
    }
    match &result {
        Ok(()) => info!(tx_id = %tx.id(), peers = peers.len(), "endorsement collected"),
        Err(e) => warn!(tx_id = %tx.id(), error = %e, "endorsement failed"),
    }
    result
}

/// Open one session per remote endpoint that signs or receives, and send
/// it the transaction. Signers covered by `opts` need no session.
async fn open_peer_sessions(
    ctx: &PartyContext,
    tx: &Transaction,
    opts: &EndorseOptions,
) -> TtxResult<Vec<Peer>> {
    let binder = ctx.hub().binder();
    let auditor_endpoint = tx.options().auditor.as_ref().map(|a| binder.resolve(a));
    let mut by_endpoint: BTreeMap<Identity, Vec<Identity>> = BTreeMap::new();

    let request = tx.request();
    for signer in request.required_signers() {
        if ctx.wallets().is_me(&signer)
            || opts.skip_signatures.contains_key(&signer)
            || opts.external_signers.contains_key(&signer)
        {
            continue;
        }
        by_endpoint.entry(binder.resolve(&signer)).or_default().push(signer);
    }
    for receiver in request.receivers() {
        if ctx.wallets().is_me(&receiver) {
            continue;
        }
        by_endpoint.entry(binder.resolve(&receiver)).or_default();
    }
    by_endpoint.remove(ctx.me());
    if let Some(a) = &auditor_endpoint {
        if by_endpoint.get(a).map(|s| s.is_empty()).unwrap_or(false) {
            by_endpoint.remove(a);
        }
    }

    let raw = tx.to_bytes()?;
    let mut peers = Vec::with_capacity(by_endpoint.len());
    for (endpoint, signers) in by_endpoint {
        let opened = async {
            let session = ctx.hub().open(ctx.me(), &endpoint).await?;
            send_json(session.as_ref(), &Opening::Transaction { raw: raw.clone() }).await?;
            Ok::<_, TtxError>(session)
        }
        .await;
        match opened {
            Ok(session) => peers.push(Peer {
                endpoint,
                session,
                signers,
            }),
            Err(e) => {
                for p in &peers {
                    p.session.close().await;
                }
                return Err(e.in_stage(format!("failed to open session to [{}]", endpoint)));
            }
        }
    }
    Ok(peers)
}

async fn endorse(
    ctx: &Arc<PartyContext>,
    tx: &mut Transaction,
    opts: &EndorseOptions,
    peers: &[Peer],
    audit_session: &mut Option<AuditSession>,
) -> TtxResult<()> {
    let to_sign = tx.request().marshal_to_sign()?;
    let required = tx.request().required_signers();

    let mut collected: BTreeMap<Identity, Vec<u8>> = BTreeMap::new();
    let mut externals: Vec<Arc<dyn ExternalWalletSigner>> = Vec::new();
    let local_result = sign_locally(ctx, opts, &required, &to_sign, &mut collected, &mut externals).await;
    for ext in &externals {
        if let Err(e) = ext.done().await {
            warn!(tx_id = %tx.id(), error = %e, "external signer cleanup failed");
        }
    }
    local_result?;

    let timeout = ctx.session_timeout(tx);
    let tx_id = tx.id().to_string();
    let already = &collected;
    let remote = try_join_all(peers.iter().filter(|p| !p.signers.is_empty()).map(|peer| {
        let to_sign = &to_sign;
        let tx_id = tx_id.clone();
        async move {
            let mut sigs = Vec::with_capacity(peer.signers.len());
            for signer in &peer.signers {
                if already.contains_key(signer) {
                    continue;
                }
                let req = EndorseMessage::SignatureRequest(SignatureRequest {
                    tx_id: tx_id.clone(),
                    request: to_sign.clone(),
                    signer: signer.clone(),
                });
                send_json(peer.session.as_ref(), &req)
                    .await
                    .stage("failed to send signature request")?;
                let resp: SignatureResponse = receive_json(peer.session.as_ref(), timeout)
                    .await
                    .stage("failed to receive signature")?;
                verify_signature(signer, to_sign, &resp.signature)?;
                debug!(tx_id = %tx_id, signer = %signer, "remote signature received");
                sigs.push((signer.clone(), resp.signature));
            }
            Ok::<_, TtxError>(sigs)
        }
    }))
    .await?;
    collected.extend(remote.into_iter().flatten());

    if let Some(missing) = required.iter().find(|s| !collected.contains_key(*s)) {
        return Err(TtxError::InvalidInput(format!("no signature from [{}]", missing)));
    }
    tx.request_mut().signatures.extend(collected);

    if tx.options().auditor.is_some() {
        *audit_session = Some(audit(ctx, tx).await.stage("failed to audit transaction")?);
    }

    let ledger = ctx
        .networks()
        .get(&tx.tms_id().network, &tx.tms_id().channel)?;
    let envelope = ledger
        .request_approval(
            &tx.tms_id().namespace,
            tx.id(),
            ctx.me(),
            tx.request().rwset(),
            tx.request().digest()?.to_vec(),
        )
        .await
        .stage("failed to request approval")?;
    tx.set_envelope(envelope);

    distribute(ctx, tx, peers, audit_session.as_ref()).await
}

async fn sign_locally(
    ctx: &PartyContext,
    opts: &EndorseOptions,
    required: &[Identity],
    to_sign: &[u8],
    collected: &mut BTreeMap<Identity, Vec<u8>>,
    externals: &mut Vec<Arc<dyn ExternalWalletSigner>>,
) -> TtxResult<()> {
    for signer in required {
        if let Some(sig) = opts.skip_signatures.get(signer) {
            verify_signature(signer, to_sign, sig).stage("invalid pre-supplied signature")?;
            collected.insert(signer.clone(), sig.clone());
            continue;
        }
        if let Some(ext) = opts.external_signers.get(signer) {
            if !externals.iter().any(|e| Arc::ptr_eq(e, ext)) {
                externals.push(ext.clone());
            }
            let sig = ext
                .sign(signer, to_sign)
                .await
                .stage("failed to sign with external wallet")?;
            verify_signature(signer, to_sign, &sig)?;
            collected.insert(signer.clone(), sig);
            continue;
        }
        if ctx.wallets().is_me(signer) {
            let kp = ctx.wallets().signer(signer)?;
            collected.insert(signer.clone(), kp.sign(to_sign).into_vec());
        }
    }
    Ok(())
}

async fn distribute(
    ctx: &PartyContext,
    tx: &Transaction,
    peers: &[Peer],
    audit_session: Option<&AuditSession>,
) -> TtxResult<()> {
    let raw = tx.to_bytes()?;
    let timeout = ctx.session_timeout(tx);
    let mut targets: Vec<(&dyn Session, &Identity)> = peers
        .iter()
        .map(|p| (p.session.as_ref(), &p.endpoint))
        .collect();
    if let Some(a) = audit_session {
        targets.push((a.session.as_ref(), &a.auditor));
    }

    let acks = try_join_all(targets.into_iter().map(|(session, party)| {
        let raw = &raw;
        async move {
            let msg = EndorseMessage::Distribution(Distribution { raw: raw.clone() });
            send_json(session, &msg)
                .await
                .stage("failed to distribute transaction")?;
            let ack: Ack = receive_json(session, timeout)
                .await
                .stage("failed to receive ack")?;
            verify_signature(party, raw, &ack.signature).stage("invalid ack")?;
            Ok::<_, TtxError>((party.clone(), ack.signature))
        }
    }))
    .await?;

    for (party, sigma) in acks {
        ctx.db()
            .append_endorsement_ack(tx.id(), &party, &sigma)
            .stage("failed to store ack")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

async fn refuse(session: &dyn Session, err: TtxError) -> TtxError {
    if let Err(e) = session.send_error(&err.to_string()).await {
        debug!(error = %e, "failed to send refusal");
    }
    err
}

/// Serve one endorsement round on the receiving side: sign what is asked
/// of this party's wallets, then acknowledge the final transaction.
pub async fn respond_endorsement(
    ctx: &PartyContext,
    session: &dyn Session,
    raw: &[u8],
) -> TtxResult<Transaction> {
    let tx = match Transaction::from_bytes(raw) {
        Ok(tx) => tx,
        Err(e) => return Err(refuse(session, e).await),
    };
    if let Err(e) = ctx.db().append(&tx) {
        return Err(refuse(session, e.in_stage("failed to append transaction")).await);
    }
    let to_sign = match tx.request().marshal_to_sign() {
        Ok(bytes) => bytes,
        Err(e) => return Err(refuse(session, e).await),
    };
    let mut expected: Vec<Identity> = tx
        .request()
        .required_signers()
        .into_iter()
        .filter(|s| ctx.wallets().is_me(s))
        .collect();

    loop {
        let timeout = if expected.is_empty() {
            ctx.session_timeout(&tx)
        } else {
            ctx.config().signature_request_timeout
        };
        let msg: EndorseMessage = receive_json(session, timeout)
            .await
            .stage("failed to receive endorsement message")?;
        match msg {
            EndorseMessage::SignatureRequest(req) => {
                let Some(pos) = expected.iter().position(|s| *s == req.signer) else {
                    let err = TtxError::SignerMismatch(format!(
                        "asked to sign [{}] as [{}], which is not an expected signer",
                        req.tx_id, req.signer
                    ));
                    return Err(refuse(session, err).await);
                };
                if req.tx_id != tx.id() || req.request != to_sign {
                    let err = TtxError::SignerMismatch(format!(
                        "signature request for [{}] does not match transaction [{}]",
                        req.tx_id,
                        tx.id()
                    ));
                    return Err(refuse(session, err).await);
                }
                let signer = expected.remove(pos);
                let kp = ctx.wallets().signer(&signer)?;
                send_json(
                    session,
                    &SignatureResponse {
                        signature: kp.sign(&to_sign).into_vec(),
                    },
                )
                .await
                .stage("failed to send signature")?;
                debug!(tx_id = %tx.id(), signer = %signer, "signature sent");
            }
            EndorseMessage::Distribution(dist) => {
                return match accept_final(ctx, session, &tx, &dist).await {
                    Ok(final_tx) => Ok(final_tx),
                    Err(e) => Err(refuse(session, e).await),
                };
            }
        }
    }
}

async fn accept_final(
    ctx: &PartyContext,
    session: &dyn Session,
    tx: &Transaction,
    dist: &Distribution,
) -> TtxResult<Transaction> {
    let final_tx = Transaction::from_bytes(&dist.raw)?;
    if final_tx.id() != tx.id()
        || final_tx.request().marshal_to_sign()? != tx.request().marshal_to_sign()?
    {
        return Err(TtxError::SignerMismatch(format!(
            "final transaction does not match [{}]",
            tx.id()
        )));
    }
    let to_sign = final_tx.request().marshal_to_sign()?;
    for signer in final_tx.request().required_signers() {
        let sig = final_tx
            .request()
            .signatures
            .get(&signer)
            .ok_or_else(|| TtxError::InvalidSignature(format!("missing signature of [{}]", signer)))?;
        verify_signature(&signer, &to_sign, sig)?;
    }
    for (auditor, sig) in &final_tx.request().auditor_signatures {
        verify_signature(auditor, &to_sign, sig)?;
    }
    let envelope = final_tx
        .envelope()
        .ok_or_else(|| TtxError::InvalidInput(format!("final transaction [{}] has no envelope", tx.id())))?;
    envelope.verify()?;
    let ledger = ctx
        .networks()
        .get(&tx.tms_id().network, &tx.tms_id().channel)?;
    ledger.store_envelope(tx.id(), &envelope.to_bytes()?)?;

    let sigma = ctx
        .endpoint_signer()
        .stage("failed to sign ack response")?
        .sign(&dist.raw);
    send_json(
        session,
        &Ack {
            signature: sigma.into_vec(),
        },
    )
    .await
    .stage("failed to send ack")?;

    if !ctx.config().no_caching_request {
        ctx.db().cache_request_best_effort(&final_tx);
    }
    info!(tx_id = %tx.id(), "endorsement acknowledged");
    Ok(final_tx)
}
