//! # Token Transactions
//!
//! The multi-party transaction lifecycle:
//!
//! ```text
//! Transaction::new
//!   │ request_recipient_identity / exchange_recipient_identities
//!   │ issue / transfer / redeem, collect_actions
//!   ▼
//! collect_endorsements ──► audit (if an auditor is configured)
//!   │                  ──► ledger approval ──► distribution + acks
//!   ▼
//! ordering ──► FinalityService::get_finality
//! ```
//!
//! Every stage takes the [`PartyContext`] of the party running it. Each
//! can be entered on its own, e.g. finality for a transaction received
//! already built. The receiving side of every interactive stage is served
//! by [`responder::serve`].

pub mod auditor;
pub mod collect;
pub mod context;
pub mod db;
pub mod endorse;
pub mod error;
pub mod external;
pub mod finality;
pub mod ordering;
pub mod recipients;
pub mod request;
pub mod responder;
pub mod transaction;
pub mod withdrawal;

pub use auditor::{audit, AuditCheck, AuditSession, AuditorService, LimitCheck};
pub use collect::{collect_actions, ActionTransfer};
pub use context::{Infrastructure, PartyBuilder, PartyContext};
pub use db::{StatusMismatch, TransactionDb};
pub use endorse::{collect_endorsements, respond_endorsement, EndorseOptions};
pub use error::{ErrorKind, StageExt, TtxError, TtxResult};
pub use external::{respond_external_wallet, ExternalWalletSigner, StreamExternalWalletSigner};
pub use finality::{get_finality, FinalityManager, FinalityService, Role};
pub use ordering::{ordering, ordering_and_finality};
pub use recipients::{exchange_recipient_identities, request_recipient_identity};
pub use request::{Action, Input, Output, TokenRequest};
pub use responder::{serve, serve_session};
pub use transaction::{TmsId, Transaction, TxId, TxOptions};
pub use withdrawal::{request_withdrawal, WithdrawalRequest};
