//! # Sessions
//!
//! Parties never share a bus. Every protocol round runs over a
//! point-to-point **session**: an ordered, bidirectional message pipe
//! between two endpoints, consumed with a receive that always carries a
//! timeout.
//!
//! ```text
//!   initiator                         responder
//!   ─────────                         ─────────
//!   hub.open(me, bob) ──────────────► inbox.accept()
//!   send(request)     ──────────────► receive(timeout)
//!   receive(timeout)  ◄────────────── send(reply)
//!   close()
//! ```
//!
//! A session is a capability ([`Session`]), not a socket. The only
//! implementation here is channel-backed ([`ChannelSession`]) and comes in
//! two flavours:
//!
//! - [`SessionKind::Network`]: opened through the [`SessionHub`], which
//!   routes it to the target endpoint's [`Inbox`] and counts it.
//! - [`SessionKind::SelfLoop`]: an in-process queue pair, built when a
//!   party has to talk to itself (e.g. the initiator is also the auditor).
//!   Calling code treats it exactly like a network session.
//!
//! Payloads are raw bytes; [`send_json`] / [`receive_json`] add the JSON
//! framing used by every wire message in the protocol.

pub mod channel;
pub mod hub;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::identity::Identity;

pub use channel::ChannelSession;
pub use hub::{EndpointBinder, Inbox, SessionHub};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No message arrived within the deadline.
    #[error("timeout waiting for message on session [{session_id}] after {timeout_ms}ms")]
    Timeout {
        /// Session that timed out.
        session_id: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// The other end closed the session.
    #[error("session [{0}] closed")]
    Closed(String),

    /// The other end replied with an explicit error.
    #[error("remote party replied with error: {0}")]
    Remote(String),

    /// The payload could not be encoded or decoded.
    #[error("session payload serialization error: {0}")]
    Serialization(String),

    /// No endpoint is registered for the identity.
    #[error("no endpoint registered for [{0}]")]
    UnknownEndpoint(Identity),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Whether a message carries a normal payload or an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Regular payload.
    Ok,
    /// The payload is a UTF-8 error description.
    Error,
}

/// One message on a session.
#[derive(Debug, Clone)]
pub struct Message {
    /// Session the message belongs to.
    pub session_id: String,
    /// Endpoint identity of the sender.
    pub caller: Identity,
    /// Payload or error.
    pub status: MessageStatus,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// How a session was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Routed through the hub to another endpoint.
    Network,
    /// In-process loop back to the same party.
    SelfLoop,
}

/// Static facts about a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session ID.
    pub id: String,
    /// Endpoint identity of this side.
    pub local: Identity,
    /// Endpoint identity of the other side.
    pub remote: Identity,
    /// Network or self-loop.
    pub kind: SessionKind,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A bidirectional, ordered message pipe to one other party.
#[async_trait]
pub trait Session: Send + Sync {
    /// Facts about this session.
    fn info(&self) -> &SessionInfo;

    /// Send a payload.
    async fn send(&self, payload: Bytes) -> Result<(), SessionError>;

    /// Send an error report. The receiver's [`receive_raw`] turns it into
    /// [`SessionError::Remote`].
    async fn send_error(&self, reason: &str) -> Result<(), SessionError>;

    /// Wait for the next message, at most `timeout`.
    async fn receive(&self, timeout: Duration) -> Result<Message, SessionError>;

    /// Close this side. Pending messages already sent stay readable by
    /// the other side. Closing twice is a no-op.
    async fn close(&self);
}

/// Receive the next payload, converting an error message into
/// [`SessionError::Remote`].
pub async fn receive_raw(session: &dyn Session, timeout: Duration) -> Result<Bytes, SessionError> {
    let msg = session.receive(timeout).await?;
    match msg.status {
        MessageStatus::Ok => Ok(msg.payload),
        MessageStatus::Error => Err(SessionError::Remote(
            String::from_utf8_lossy(&msg.payload).into_owned(),
        )),
    }
}

/// Serialize `value` as JSON and send it.
pub async fn send_json<T: Serialize + ?Sized>(
    session: &dyn Session,
    value: &T,
) -> Result<(), SessionError> {
    let raw = serde_json::to_vec(value).map_err(|e| SessionError::Serialization(e.to_string()))?;
    session.send(Bytes::from(raw)).await
}

/// Receive a JSON payload and decode it.
pub async fn receive_json<T: DeserializeOwned>(
    session: &dyn Session,
    timeout: Duration,
) -> Result<T, SessionError> {
    let raw = receive_raw(session, timeout).await?;
    serde_json::from_slice(&raw).map_err(|e| SessionError::Serialization(e.to_string()))
}
