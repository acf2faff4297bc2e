//! # Action Collection
//!
//! Multi-party transactions (swaps, joint payments) need each party to
//! contribute the leg it pays for. [`collect_actions`] walks the requested
//! transfers: a sender held by a local wallet is handled in-process, a
//! remote one receives the transaction and appends its own transfer.
//!
//! The remote reply is only accepted if it is still valid, keeps the same
//! ID and metadata, and extends the previous actions by exactly one.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::context::PartyContext;
use super::error::{StageExt, TtxError, TtxResult};
use super::responder::Opening;
use super::transaction::{TmsId, Transaction};
use crate::identity::{Identity, PartyLocation, RecipientData, WalletError, WalletService};
use crate::session::{receive_json, send_json, Session};

/// One leg: `from` pays `amount` of `token_type` to `recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionTransfer {
    pub from: Identity,
    #[serde(rename = "Type")]
    pub token_type: String,
    pub amount: u64,
    pub recipient: Identity,
}

/// Sent to a remote payer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionRequest {
    #[serde(rename = "TMSID")]
    pub tms_id: TmsId,
    pub transaction: Vec<u8>,
    pub actions: Vec<ActionTransfer>,
    /// Index into `actions` of the leg the receiver must add.
    pub requested: usize,
    /// Recipient data of every recipient in `actions`.
    pub recipient_data: Vec<RecipientData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionResponse {
    pub transaction: Vec<u8>,
}

fn recipient_data_for(ctx: &PartyContext, id: &Identity) -> TtxResult<RecipientData> {
    Ok(RecipientData {
        identity: id.clone(),
        audit_info: ctx.wallets().audit_info(id)?,
        token_metadata: ctx.wallets().token_metadata(id)?,
    })
}

/// Append every leg in `actions` to `tx`, asking remote payers for theirs.
pub async fn collect_actions(
    ctx: &PartyContext,
    tx: &mut Transaction,
    actions: &[ActionTransfer],
) -> TtxResult<()> {
    for (i, action) in actions.iter().enumerate() {
        match ctx.wallets().locate(&action.from) {
            PartyLocation::Local(wallet) => {
                let recipient = recipient_data_for(ctx, &action.recipient)?;
                tx.transfer(ctx, &wallet, &action.token_type, &[action.amount], &[recipient])
                    .await
                    .stage("failed to append local transfer")?;
                debug!(tx_id = %tx.id(), leg = i, "local leg appended");
            }
            PartyLocation::Remote => {
                let recipients = actions
                    .iter()
                    .map(|a| recipient_data_for(ctx, &a.recipient))
                    .collect::<TtxResult<Vec<_>>>()?;
                let req = ActionRequest {
                    tms_id: tx.tms_id().clone(),
                    transaction: tx.to_bytes()?,
                    actions: actions.to_vec(),
                    requested: i,
                    recipient_data: recipients,
                };
                let updated = request_remote_leg(ctx, tx, &action.from, req)
                    .await
                    .stage("failed to collect remote action")?;
                *tx = updated;
                debug!(tx_id = %tx.id(), leg = i, payer = %action.from, "remote leg appended");
            }
        }
    }
    info!(tx_id = %tx.id(), legs = actions.len(), "actions collected");
    Ok(())
}

async fn request_remote_leg(
    ctx: &PartyContext,
    tx: &Transaction,
    payer: &Identity,
    req: ActionRequest,
) -> TtxResult<Transaction> {
    let session = ctx.hub().open(ctx.me(), payer).await?;
    let result = async {
        send_json(session.as_ref(), &Opening::ActionRequest(req)).await?;
        let resp: ActionResponse = receive_json(session.as_ref(), ctx.session_timeout(tx)).await?;
        let updated = Transaction::from_bytes_with_options(&resp.transaction, tx.options().clone())?;
        check_extension(tx, &updated)?;
        Ok::<_, TtxError>(updated)
    }
    .await;
    session.close().await;
    result
}

/// `updated` must be `before` plus exactly one valid action.
fn check_extension(before: &Transaction, updated: &Transaction) -> TtxResult<()> {
    if updated.id() != before.id() {
        return Err(TtxError::SignerMismatch(format!(
            "reply carries transaction [{}], expected [{}]",
            updated.id(),
            before.id()
        )));
    }
    updated.validate().stage("transaction is not valid")?;
    let old = &before.request().actions;
    let new = &updated.request().actions;
    if new.len() != old.len() + 1 || new[..old.len()] != old[..] {
        return Err(TtxError::SignerMismatch(
            "reply does not extend the transaction by exactly one action".to_string(),
        ));
    }
    if updated.request().metadata != before.request().metadata {
        return Err(TtxError::SignerMismatch("reply changed request metadata".to_string()));
    }
    Ok(())
}

/// Add the requested leg with this party's wallet and send the
/// transaction back.
pub async fn respond_action_request(
    ctx: &PartyContext,
    session: &dyn Session,
    req: ActionRequest,
) -> TtxResult<Transaction> {
    let result = async {
        let mut tx = Transaction::from_bytes(&req.transaction)?;
        let action = req.actions.get(req.requested).ok_or_else(|| {
            TtxError::InvalidInput(format!("requested action {} does not exist", req.requested))
        })?;
        let recipient = req
            .recipient_data
            .iter()
            .find(|d| d.identity == action.recipient)
            .cloned()
            .ok_or_else(|| TtxError::InvalidInput("missing recipient data".to_string()))?;
        ctx.wallets().register_recipient_identity(&recipient)?;
        let wallet = match ctx.wallets().locate(&action.from) {
            PartyLocation::Local(w) => w,
            PartyLocation::Remote => return Err(WalletError::NotMine(action.from.clone()).into()),
        };
        tx.transfer(ctx, &wallet, &action.token_type, &[action.amount], &[recipient])
            .await?;
        Ok::<_, TtxError>(tx)
    }
    .await;

    match result {
        Ok(tx) => {
            send_json(
                session,
                &ActionResponse {
                    transaction: tx.to_bytes()?,
                },
            )
            .await
            .stage("failed to send transaction back")?;
            Ok(tx)
        }
        Err(e) => {
            if let Err(se) = session.send_error(&e.to_string()).await {
                debug!(error = %se, "failed to send refusal");
            }
            Err(e)
        }
    }
}
