//! Withdrawal: a party asks an issuer to issue tokens to it.
//!
//! The requester sends a [`WithdrawalRequest`] carrying fresh recipient
//! data. The issuer learns the recipient, binds the requester's endpoint to
//! it and hands the request to whoever subscribed on its party context
//! ([`PartyContext::subscribe_withdrawals`]); that subscriber then builds
//! and endorses the issue transaction as usual.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::context::PartyContext;
use super::error::{StageExt, TtxError, TtxResult};
use super::responder::Opening;
use super::transaction::TmsId;
use crate::identity::{Identity, RecipientData, WalletService};
use crate::session::{send_json, Session};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WithdrawalRequest {
    #[serde(rename = "TMSID")]
    pub tms_id: TmsId,
    pub recipient_data: RecipientData,
    pub token_type: String,
    pub amount: u64,
    pub not_anonymous: bool,
}

/// Ask `issuer` for `amount` of `token_type`, to be received by
/// `wallet_id`. Returns the recipient data the issuer will pay.
pub async fn request_withdrawal(
    ctx: &PartyContext,
    issuer: &Identity,
    tms_id: &TmsId,
    wallet_id: &str,
    token_type: &str,
    amount: u64,
    not_anonymous: bool,
) -> TtxResult<RecipientData> {
    if amount == 0 {
        return Err(TtxError::InvalidInput("cannot withdraw zero tokens".to_string()));
    }
    let wallet = ctx.wallets().wallet_or_default(wallet_id)?;
    let recipient_data = if not_anonymous {
        wallet.default_recipient_data()
    } else {
        wallet.recipient_data()
    };
    let req = WithdrawalRequest {
        tms_id: tms_id.clone(),
        recipient_data: recipient_data.clone(),
        token_type: token_type.to_string(),
        amount,
        not_anonymous,
    };

    let session = ctx
        .hub()
        .open(ctx.me(), issuer)
        .await
        .stage("failed to open session to issuer")?;
    let sent = send_json(session.as_ref(), &Opening::WithdrawalRequest(req)).await;
    session.close().await;
    sent.stage("failed to send withdrawal request")?;
    ctx.hub().bind(ctx.me(), &recipient_data.identity);
    info!(issuer = %issuer, token_type = %token_type, amount, "withdrawal requested");
    Ok(recipient_data)
}

/// Issuer side: learn the recipient and forward the request to the
/// withdrawal subscriber, if any.
pub async fn receive_withdrawal_request(
    ctx: &PartyContext,
    session: &dyn Session,
    req: WithdrawalRequest,
) -> TtxResult<WithdrawalRequest> {
    if req.amount == 0 {
        return Err(TtxError::InvalidInput("withdrawal of zero tokens".to_string()));
    }
    ctx.wallets()
        .register_recipient_identity(&req.recipient_data)
        .stage("failed to register recipient identity")?;
    ctx.hub()
        .bind(&session.info().remote, &req.recipient_data.identity);

    match ctx.withdrawal_sink() {
        Some(sink) => {
            if sink.send(req.clone()).await.is_err() {
                warn!(tms = %req.tms_id, "withdrawal subscriber went away");
            }
        }
        None => warn!(tms = %req.tms_id, "withdrawal request received but nobody subscribed"),
    }
    info!(
        recipient = %req.recipient_data.identity,
        token_type = %req.token_type,
        amount = req.amount,
        "withdrawal request received"
    );
    Ok(req)
}
