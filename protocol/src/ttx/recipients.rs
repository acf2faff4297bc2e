//! # Recipient Identity Exchange
//!
//! Before a payment can name its receiver, the sender needs one of the
//! receiver's recipient identities together with its audit info and token
//! metadata.
//!
//! ```text
//! sender                                   receiver
//!   │ RecipientRequest { TMSID, WalletID }    │
//!   ├────────────────────────────────────────►│ fresh pseudonym from wallet
//!   │                         RecipientData   │ bind me ↔ pseudonym
//!   │◄────────────────────────────────────────┤
//!   │ register recipient                      │
//!   │ bind receiver endpoint ↔ pseudonym      │
//! ```
//!
//! A receiver held by a local wallet is answered in-process without a
//! session. The exchange variant sends the sender's own recipient data in
//! the request so both sides learn each other's pseudonym in one round
//! trip.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::context::PartyContext;
use super::error::{StageExt, TtxError, TtxResult};
use super::transaction::TmsId;
use crate::identity::{Identity, PartyLocation, RecipientData, WalletError, WalletService};
use crate::session::{receive_json, send_json, Session};

use super::responder::Opening;

/// Ask a party for one of its recipient identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecipientRequest {
    #[serde(rename = "TMSID")]
    pub tms_id: TmsId,
    /// Wallet the receiver should use; empty selects its default.
    #[serde(rename = "WalletID")]
    pub wallet_id: String,
    /// Recipient data the receiver should answer with instead of a fresh
    /// one. Must belong to the selected wallet.
    pub recipient_data: Option<RecipientData>,
    pub multisig: bool,
}

/// Both sides swap recipient data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExchangeRecipientRequest {
    #[serde(rename = "TMSID")]
    pub tms_id: TmsId,
    #[serde(rename = "WalletID")]
    pub wallet_id: String,
    pub recipient_data: RecipientData,
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

/// A recipient identity of `other` for `tms_id`.
pub async fn request_recipient_identity(
    ctx: &PartyContext,
    other: &Identity,
    tms_id: &TmsId,
    wallet_id: &str,
) -> TtxResult<RecipientData> {
    if let PartyLocation::Local(wallet) = ctx.wallets().locate(other) {
        debug!(other = %other, wallet = %wallet.id(), "recipient is local");
        return Ok(wallet.recipient_data());
    }

    let session = ctx
        .hub()
        .open(ctx.me(), other)
        .await
        .stage("failed to open session to recipient")?;
    let result = async {
        let req = RecipientRequest {
            tms_id: tms_id.clone(),
            wallet_id: wallet_id.to_string(),
            recipient_data: None,
            multisig: false,
        };
        send_json(session.as_ref(), &Opening::RecipientRequest(req))
            .await
            .stage("failed to send recipient request")?;
        let data: RecipientData = receive_json(session.as_ref(), ctx.config().session_timeout)
            .await
            .stage("failed to receive recipient identity")?;
        learn_recipient(ctx, session.as_ref(), &data)?;
        Ok::<_, TtxError>(data)
    }
    .await;
    session.close().await;
    result
}

/// Swap recipient identities with `other`: returns `(mine, theirs)`.
pub async fn exchange_recipient_identities(
    ctx: &PartyContext,
    tms_id: &TmsId,
    wallet_id: &str,
    other: &Identity,
    other_wallet_id: &str,
) -> TtxResult<(RecipientData, RecipientData)> {
    let mine = ctx
        .wallets()
        .recipient_identity(Some(wallet_id))
        .stage("failed to get local recipient identity")?;

    if let PartyLocation::Local(wallet) = ctx.wallets().locate(other) {
        return Ok((mine, wallet.recipient_data()));
    }

    let session = ctx
        .hub()
        .open(ctx.me(), other)
        .await
        .stage("failed to open session to recipient")?;
    let result = async {
        let req = ExchangeRecipientRequest {
            tms_id: tms_id.clone(),
            wallet_id: other_wallet_id.to_string(),
            recipient_data: mine.clone(),
        };
        send_json(session.as_ref(), &Opening::ExchangeRecipientRequest(req))
            .await
            .stage("failed to send exchange request")?;
        let theirs: RecipientData = receive_json(session.as_ref(), ctx.config().session_timeout)
            .await
            .stage("failed to receive recipient identity")?;
        learn_recipient(ctx, session.as_ref(), &theirs)?;
        ctx.hub().bind(ctx.me(), &mine.identity);
        Ok::<_, TtxError>(theirs)
    }
    .await;
    session.close().await;
    Ok((mine, result?))
}

fn learn_recipient(ctx: &PartyContext, session: &dyn Session, data: &RecipientData) -> TtxResult<()> {
    if data.identity.is_none() {
        return Err(TtxError::InvalidInput("empty recipient identity".to_string()));
    }
    ctx.wallets()
        .register_recipient_identity(data)
        .stage("failed to register recipient identity")?;
    ctx.hub().bind(&session.info().remote, &data.identity);
    info!(recipient = %data.identity, endpoint = %session.info().remote, "recipient identity learned");
    Ok(())
}

// ---------------------------------------------------------------------------
// Responders
// ---------------------------------------------------------------------------

async fn reply_or_refuse<T: Serialize>(session: &dyn Session, result: TtxResult<T>) -> TtxResult<T> {
    match result {
        Ok(v) => {
            send_json(session, &v)
                .await
                .stage("failed to send recipient identity")?;
            Ok(v)
        }
        Err(e) => {
            if let Err(se) = session.send_error(&e.to_string()).await {
                debug!(error = %se, "failed to send refusal");
            }
            Err(e)
        }
    }
}

/// Answer a [`RecipientRequest`].
pub async fn respond_recipient_request(
    ctx: &PartyContext,
    session: &dyn Session,
    req: RecipientRequest,
) -> TtxResult<RecipientData> {
    let data = (|| -> TtxResult<RecipientData> {
        if req.multisig {
            return Err(TtxError::InvalidInput(
                "multisig recipient identities are not supported".to_string(),
            ));
        }
        let wallet = ctx.wallets().wallet_or_default(&req.wallet_id)?;
        match req.recipient_data {
            Some(data) if !wallet.contains(&data.identity) => {
                Err(WalletError::NotMine(data.identity).into())
            }
            Some(data) => Ok(data),
            None => Ok(wallet.recipient_data()),
        }
    })();
    let data = reply_or_refuse(session, data).await?;
    ctx.hub().bind(ctx.me(), &data.identity);
    debug!(tms = %req.tms_id, recipient = %data.identity, "recipient identity sent");
    Ok(data)
}

/// Answer an [`ExchangeRecipientRequest`]: returns `(mine, theirs)`.
pub async fn respond_exchange_recipient_identities(
    ctx: &PartyContext,
    session: &dyn Session,
    req: ExchangeRecipientRequest,
) -> TtxResult<(RecipientData, RecipientData)> {
    let theirs = req.recipient_data;
    let mine = (|| -> TtxResult<RecipientData> {
        ctx.wallets().register_recipient_identity(&theirs)?;
        let wallet = ctx.wallets().wallet_or_default(&req.wallet_id)?;
        Ok(wallet.recipient_data())
    })();
    let mine = reply_or_refuse(session, mine).await?;
    ctx.hub().bind(ctx.me(), &mine.identity);
    ctx.hub().bind(&session.info().remote, &theirs.identity);
    Ok((mine, theirs))
}
