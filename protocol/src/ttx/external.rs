//! # External Wallet Signing
//!
//! Some signers keep their keys outside the party process: a hardware
//! wallet, a browser, a mobile client. The endorsement round reaches them
//! through an [`ExternalWalletSigner`] and always calls
//! [`ExternalWalletSigner::done`] afterwards, whether or not signing
//! succeeded.
//!
//! [`StreamExternalWalletSigner`] drives such a client over a session:
//!
//! ```text
//! party                                   wallet client
//!   │ { Type: 1 (SigRequest), Raw }          │
//!   ├───────────────────────────────────────►│ sign
//!   │        { Type: 2 (SignResponse), Raw } │
//!   │◄───────────────────────────────────────┤
//!   │ ...                                    │
//!   │ { Type: 3 (Done) }                     │
//!   ├───────────────────────────────────────►│ stop
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::{StageExt, TtxError, TtxResult};
use crate::identity::{Identity, Wallet, WalletError};
use crate::session::{receive_json, send_json, Session};

/// Signs on behalf of identities whose keys this party does not hold.
#[async_trait]
pub trait ExternalWalletSigner: Send + Sync {
    /// Signature of `party` over `message`.
    async fn sign(&self, party: &Identity, message: &[u8]) -> TtxResult<Vec<u8>>;

    /// No more requests will follow.
    async fn done(&self) -> TtxResult<()>;
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Message kind, encoded as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StreamMsgType {
    SigRequest = 1,
    SignResponse = 2,
    Done = 3,
}

impl From<StreamMsgType> for u8 {
    fn from(t: StreamMsgType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for StreamMsgType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(StreamMsgType::SigRequest),
            2 => Ok(StreamMsgType::SignResponse),
            3 => Ok(StreamMsgType::Done),
            other => Err(format!("unknown external wallet message type {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamExternalWalletMsg {
    #[serde(rename = "Type")]
    pub msg_type: StreamMsgType,
    pub raw: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SigRequest {
    party: Identity,
    message: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Session-backed signer
// ---------------------------------------------------------------------------

/// [`ExternalWalletSigner`] talking to a wallet client over a session.
pub struct StreamExternalWalletSigner {
    session: Arc<dyn Session>,
    timeout: Duration,
}

impl StreamExternalWalletSigner {
    pub fn new(session: Arc<dyn Session>, timeout: Duration) -> Self {
        Self { session, timeout }
    }
}

#[async_trait]
impl ExternalWalletSigner for StreamExternalWalletSigner {
    async fn sign(&self, party: &Identity, message: &[u8]) -> TtxResult<Vec<u8>> {
        let raw = serde_json::to_vec(&SigRequest {
            party: party.clone(),
            message: message.to_vec(),
        })
        .map_err(TtxError::serialization)?;
        send_json(
            self.session.as_ref(),
            &StreamExternalWalletMsg {
                msg_type: StreamMsgType::SigRequest,
                raw,
            },
        )
        .await
        .stage("failed to send signature request to external wallet")?;

        let reply: StreamExternalWalletMsg = receive_json(self.session.as_ref(), self.timeout)
            .await
            .stage("failed to receive signature from external wallet")?;
        if reply.msg_type != StreamMsgType::SignResponse {
            return Err(TtxError::InvalidInput(format!(
                "expected a signature response, got {:?}",
                reply.msg_type
            )));
        }
        Ok(reply.raw)
    }

    async fn done(&self) -> TtxResult<()> {
        send_json(
            self.session.as_ref(),
            &StreamExternalWalletMsg {
                msg_type: StreamMsgType::Done,
                raw: Vec::new(),
            },
        )
        .await?;
        Ok(())
    }
}

/// Wallet-client side: answer signature requests with `wallet`'s keys until
/// `Done`. Returns the number of signatures produced.
pub async fn respond_external_wallet(
    session: &dyn Session,
    wallet: &Wallet,
    timeout: Duration,
) -> TtxResult<usize> {
    let mut signed = 0;
    loop {
        let msg: StreamExternalWalletMsg = receive_json(session, timeout).await?;
        match msg.msg_type {
            StreamMsgType::Done => {
                debug!(wallet = %wallet.id(), signed, "external wallet done");
                return Ok(signed);
            }
            StreamMsgType::SignResponse => {
                return Err(TtxError::InvalidInput(
                    "unexpected signature response sent to wallet".to_string(),
                ));
            }
            StreamMsgType::SigRequest => {
                let req: SigRequest =
                    serde_json::from_slice(&msg.raw).map_err(TtxError::serialization)?;
                let Some(kp) = wallet.signer(&req.party) else {
                    let err = WalletError::NotMine(req.party);
                    if let Err(se) = session.send_error(&err.to_string()).await {
                        warn!(error = %se, "failed to refuse signature request");
                    }
                    return Err(err.into());
                };
                let sigma = kp.sign(&req.message);
                send_json(
                    session,
                    &StreamExternalWalletMsg {
                        msg_type: StreamMsgType::SignResponse,
                        raw: sigma.into_vec(),
                    },
                )
                .await?;
                signed += 1;
            }
        }
    }
}
