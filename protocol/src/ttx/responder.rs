//! # Responder
//!
//! The receiving side of every protocol. The first message on an incoming
//! session is an [`Opening`] naming the protocol; [`serve_session`] routes
//! it to the matching responder and closes the session afterwards.
//!
//! ```text
//! inbox.accept ─► serve_session
//!                   RecipientRequest          ─► respond_recipient_request
//!                   ExchangeRecipientRequest  ─► respond_exchange_recipient_identities
//!                   ActionRequest             ─► respond_action_request
//!                   Transaction               ─► respond_endorsement
//!                   Audit                     ─► audit_approve (auditors only)
//!                   WithdrawalRequest         ─► receive_withdrawal_request
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::auditor::audit_approve;
use super::collect::{respond_action_request, ActionRequest};
use super::context::PartyContext;
use super::endorse::respond_endorsement;
use super::error::{TtxError, TtxResult};
use super::recipients::{
    respond_exchange_recipient_identities, respond_recipient_request, ExchangeRecipientRequest,
    RecipientRequest,
};
use super::withdrawal::{receive_withdrawal_request, WithdrawalRequest};
use crate::session::{receive_json, Session, SessionError};

/// First message of every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Body")]
pub enum Opening {
    RecipientRequest(RecipientRequest),
    ExchangeRecipientRequest(ExchangeRecipientRequest),
    ActionRequest(ActionRequest),
    /// A transaction to endorse.
    Transaction {
        #[serde(rename = "Raw")]
        raw: Vec<u8>,
    },
    /// A transaction to audit.
    Audit {
        #[serde(rename = "Raw")]
        raw: Vec<u8>,
    },
    WithdrawalRequest(WithdrawalRequest),
}

impl Opening {
    fn name(&self) -> &'static str {
        match self {
            Opening::RecipientRequest(_) => "recipient request",
            Opening::ExchangeRecipientRequest(_) => "recipient exchange",
            Opening::ActionRequest(_) => "action request",
            Opening::Transaction { .. } => "endorsement",
            Opening::Audit { .. } => "audit",
            Opening::WithdrawalRequest(_) => "withdrawal",
        }
    }
}

/// Handle one incoming session to completion, then close it.
pub async fn serve_session(ctx: Arc<PartyContext>, session: Arc<dyn Session>) {
    let session_id = session.info().id.clone();
    match dispatch(&ctx, session.as_ref()).await {
        Ok(protocol) => debug!(session_id = %session_id, protocol, "session served"),
        Err(e) => warn!(session_id = %session_id, error = %e, "session failed"),
    }
    session.close().await;
}

async fn dispatch(ctx: &PartyContext, session: &dyn Session) -> TtxResult<&'static str> {
    let opening: Opening = receive_json(session, ctx.config().session_timeout).await?;
    let protocol = opening.name();
    debug!(session_id = %session.info().id, caller = %session.info().remote, protocol, "session opened");
    match opening {
        Opening::RecipientRequest(req) => {
            respond_recipient_request(ctx, session, req).await?;
        }
        Opening::ExchangeRecipientRequest(req) => {
            respond_exchange_recipient_identities(ctx, session, req).await?;
        }
        Opening::ActionRequest(req) => {
            respond_action_request(ctx, session, req).await?;
        }
        Opening::Transaction { raw } => {
            respond_endorsement(ctx, session, &raw).await?;
        }
        Opening::Audit { raw } => match ctx.auditor() {
            Some(service) => audit_approve(ctx, service, session, &raw).await?,
            None => {
                let err = TtxError::InvalidInput(format!("[{}] is not an auditor", ctx.me()));
                if let Err(se) = session.send_error(&err.to_string()).await {
                    warn!(error = %se, "failed to report missing auditor");
                }
                return Err(err);
            }
        },
        Opening::WithdrawalRequest(req) => {
            receive_withdrawal_request(ctx, session, req).await?;
        }
    }
    Ok(protocol)
}

/// Accept sessions on the party's inbox until shutdown, serving each on
/// its own task.
pub fn serve(ctx: Arc<PartyContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown_signal();
        let poll = ctx.config().session_timeout;
        info!(party = %ctx.me(), "responder started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                accepted = ctx.inbox().accept(poll) => match accepted {
                    Ok(session) => {
                        tokio::spawn(serve_session(ctx.clone(), session));
                    }
                    Err(SessionError::Timeout { .. }) => {}
                    Err(e) => {
                        warn!(party = %ctx.me(), error = %e, "inbox closed");
                        break;
                    }
                },
            }
        }
        info!(party = %ctx.me(), "responder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_is_tagged() {
        let json = serde_json::to_string(&Opening::Audit { raw: vec![7] }).unwrap();
        assert_eq!(json, r#"{"Type":"Audit","Body":{"Raw":[7]}}"#);
        let back: Opening = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name(), "audit");
    }
}
