//! Ordering: hand the endorsed envelope to the ledger, then optionally
//! wait for finality.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::context::PartyContext;
use super::error::{StageExt, TtxError, TtxResult};
use super::finality::{get_finality, Role};
use super::transaction::Transaction;

/// Broadcast the envelope of `tx`. The token request is cached afterwards
/// unless the transaction or the party disabled caching; a caching failure
/// is only logged.
pub async fn ordering(ctx: &PartyContext, tx: &Transaction) -> TtxResult<()> {
    let envelope = tx
        .envelope()
        .ok_or_else(|| TtxError::InvalidInput(format!("transaction [{}] has no envelope", tx.id())))?;
    if envelope.tx_id.is_empty() {
        return Err(TtxError::InvalidInput("envelope has an empty transaction id".to_string()));
    }
    let ledger = ctx
        .networks()
        .get(&tx.tms_id().network, &tx.tms_id().channel)
        .stage("failed to get network")?;
    ledger
        .broadcast(envelope)
        .await
        .stage("failed to broadcast transaction")?;
    info!(tx_id = %tx.id(), network = %tx.tms_id().network, "transaction broadcast");

    if !(tx.options().no_caching_request || ctx.config().no_caching_request) {
        ctx.db().cache_request_best_effort(tx);
    }
    Ok(())
}

/// [`ordering`] followed by a finality wait. `timeout` defaults to the
/// configured finality timeout.
pub async fn ordering_and_finality(
    ctx: &Arc<PartyContext>,
    tx: &Transaction,
    timeout: Option<Duration>,
) -> TtxResult<()> {
    ordering(ctx, tx).await?;
    get_finality(ctx, tx.tms_id(), tx.id(), Role::Owner, timeout, None)
        .await
        .stage("failed to get finality")
}
