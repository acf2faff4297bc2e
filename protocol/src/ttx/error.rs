//! Protocol errors.
//!
//! [`TtxError`] wraps every lower-level error and can be wrapped again with
//! the name of the step that failed ([`TtxError::Stage`]). Callers branch on
//! [`TtxError::kind`], which looks through any number of stage wrappers.

use thiserror::Error;

use crate::identity::WalletError;
use crate::ledger::LedgerError;
use crate::selector::SelectorError;
use crate::session::SessionError;
use crate::storage::StoreError;
use crate::vault::VaultError;

/// Machine-checkable error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or inconsistent input. Never retried.
    InvalidInput,
    /// No reply or result within the deadline.
    Timeout,
    /// The status store failed.
    Storage,
    /// Someone asked for, or produced, a signature for the wrong party or
    /// the wrong content.
    SignerMismatch,
    /// Not enough free tokens; see the selector error for the variant.
    InsufficientFunds,
    /// The ledger rejected the transaction.
    FinalityInvalid,
    /// The other party replied with an error.
    Remote,
    /// The session broke.
    Session,
    /// Encoding or decoding failed.
    Serialization,
    /// A signature did not verify.
    InvalidSignature,
    /// The caller cancelled the wait.
    Cancelled,
    /// The ledger backend failed.
    Ledger,
    /// The wallet subsystem failed.
    Wallet,
}

/// Errors raised by the transaction protocol.
#[derive(Debug, Error)]
pub enum TtxError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Security-relevant mismatch between what was expected and what was
    /// received.
    #[error("signer mismatch: {0}")]
    SignerMismatch(String),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    /// The ledger marked the transaction invalid.
    #[error("transaction [{tx_id}] is not valid [{message}]")]
    FinalityInvalid { tx_id: String, message: String },

    /// A finality wait on a transaction nobody recorded.
    #[error("transaction [{0}] is unknown")]
    UnknownTransaction(String),

    #[error("remote party error: {0}")]
    Remote(String),

    #[error("session error: {0}")]
    Session(SessionError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// An audit check refused the transaction.
    #[error("audit check failed: {0}")]
    AuditCheck(String),

    /// A failed step, with the error that caused it.
    #[error("{stage}: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<TtxError>,
    },
}

pub type TtxResult<T> = Result<T, TtxError>;

impl TtxError {
    /// Error class, looking through stage wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TtxError::InvalidInput(_) | TtxError::UnknownTransaction(_) | TtxError::AuditCheck(_) => {
                ErrorKind::InvalidInput
            }
            TtxError::Timeout(_) => ErrorKind::Timeout,
            TtxError::Storage(_) => ErrorKind::Storage,
            TtxError::SignerMismatch(_) => ErrorKind::SignerMismatch,
            TtxError::Selector(_) => ErrorKind::InsufficientFunds,
            TtxError::FinalityInvalid { .. } => ErrorKind::FinalityInvalid,
            TtxError::Remote(_) => ErrorKind::Remote,
            TtxError::Session(_) => ErrorKind::Session,
            TtxError::Serialization(_) => ErrorKind::Serialization,
            TtxError::InvalidSignature(_) => ErrorKind::InvalidSignature,
            TtxError::Cancelled(_) => ErrorKind::Cancelled,
            TtxError::Ledger(_) | TtxError::Vault(_) => ErrorKind::Ledger,
            TtxError::Wallet(_) => ErrorKind::Wallet,
            TtxError::Stage { source, .. } => source.kind(),
        }
    }

    /// The innermost non-stage error.
    pub fn root(&self) -> &TtxError {
        let mut err = self;
        while let TtxError::Stage { source, .. } = err {
            err = source;
        }
        err
    }

    /// Stage names from outermost to innermost.
    pub fn stages(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut err = self;
        while let TtxError::Stage { stage, source } = err {
            out.push(stage.as_str());
            err = source;
        }
        out
    }

    /// Wrap into a stage.
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        TtxError::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn serialization(e: impl std::fmt::Display) -> Self {
        TtxError::Serialization(e.to_string())
    }
}

impl From<SessionError> for TtxError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Timeout { .. } => TtxError::Timeout(e.to_string()),
            SessionError::Remote(reason) => TtxError::Remote(reason),
            SessionError::Serialization(msg) => TtxError::Serialization(msg),
            other => TtxError::Session(other),
        }
    }
}

impl From<bincode::Error> for TtxError {
    fn from(e: bincode::Error) -> Self {
        TtxError::Serialization(e.to_string())
    }
}

/// `.stage("...")` on any result whose error converts into [`TtxError`].
pub trait StageExt<T> {
    fn stage(self, stage: &str) -> TtxResult<T>;
}

impl<T, E: Into<TtxError>> StageExt<T> for Result<T, E> {
    fn stage(self, stage: &str) -> TtxResult<T> {
        self.map_err(|e| e.into().in_stage(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_stages() {
        let err: TtxResult<()> = Err(TtxError::Timeout("no reply".into()));
        let err = err
            .stage("failed to receive signature")
            .stage("failed to collect endorsements")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            err.stages(),
            vec!["failed to collect endorsements", "failed to receive signature"]
        );
        assert_eq!(
            err.to_string(),
            "failed to collect endorsements: failed to receive signature: timeout: no reply"
        );
    }

    #[test]
    fn session_errors_map_to_kinds() {
        let t: TtxError = SessionError::Timeout {
            session_id: "s".into(),
            timeout_ms: 10,
        }
        .into();
        assert_eq!(t.kind(), ErrorKind::Timeout);

        let r: TtxError = SessionError::Remote("limit".into()).into();
        assert!(matches!(r, TtxError::Remote(ref m) if m == "limit"));

        let c: TtxError = SessionError::Closed("s".into()).into();
        assert_eq!(c.kind(), ErrorKind::Session);
    }

    #[test]
    fn lower_layer_errors_convert() {
        let e: Result<(), StoreError> = Err(StoreError::Unavailable("down".into()));
        assert_eq!(e.stage("x").unwrap_err().kind(), ErrorKind::Storage);

        let e: TtxError = SelectorError::SufficientFundsButConcurrencyIssue {
            token_type: "USD".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::InsufficientFunds);
    }
}
