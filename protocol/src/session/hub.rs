//! # Session Hub
//!
//! The in-memory network that connects party endpoints. Each party
//! registers its endpoint identity and gets an [`Inbox`] of incoming
//! sessions; anybody can [`SessionHub::open`] a session to a registered
//! endpoint.
//!
//! Recipient identities are pseudonyms, not endpoints. After an identity
//! exchange the learning side **binds** the pseudonym to the endpoint it
//! came from ([`EndpointBinder`]), so a later `open(me, pseudonym)` lands at
//! the right party.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::channel::ChannelSession;
use super::{Session, SessionError, SessionKind};
use crate::config::INBOX_CAPACITY;
use crate::identity::Identity;

// ---------------------------------------------------------------------------
// EndpointBinder
// ---------------------------------------------------------------------------

/// Maps identities (pseudonyms) to the endpoint identity that serves them.
#[derive(Debug, Default)]
pub struct EndpointBinder {
    bindings: DashMap<Identity, Identity>,
}

impl EndpointBinder {
    /// Empty binder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `alias` to `endpoint`. Binding an endpoint to itself is a no-op.
    pub fn bind(&self, endpoint: &Identity, alias: &Identity) {
        if endpoint == alias {
            return;
        }
        debug!(endpoint = %endpoint, alias = %alias, "binding identity to endpoint");
        self.bindings.insert(alias.clone(), endpoint.clone());
    }

    /// The endpoint serving `id`; `id` itself when unbound.
    pub fn resolve(&self, id: &Identity) -> Identity {
        self.bindings
            .get(id)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| id.clone())
    }
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// Incoming sessions for one endpoint.
pub struct Inbox {
    owner: Identity,
    rx: tokio::sync::Mutex<mpsc::Receiver<Arc<dyn Session>>>,
}

impl Inbox {
    /// Endpoint identity this inbox serves.
    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    /// Wait for the next incoming session.
    pub async fn accept(&self, timeout: Duration) -> Result<Arc<dyn Session>, SessionError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(SessionError::Closed(format!("inbox of {}", self.owner))),
            Err(_) => Err(SessionError::Timeout {
                session_id: format!("inbox of {}", self.owner),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionHub
// ---------------------------------------------------------------------------

/// In-memory router of sessions between party endpoints.
#[derive(Default)]
pub struct SessionHub {
    inboxes: DashMap<Identity, mpsc::Sender<Arc<dyn Session>>>,
    binder: EndpointBinder,
    opened: AtomicU64,
}

impl SessionHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and return its inbox. Registering the same
    /// endpoint again replaces the previous inbox.
    pub fn register(&self, endpoint: &Identity) -> Inbox {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        if self.inboxes.insert(endpoint.clone(), tx).is_some() {
            warn!(endpoint = %endpoint, "endpoint re-registered, previous inbox dropped");
        }
        Inbox {
            owner: endpoint.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// The endpoint binder used to route pseudonyms.
    pub fn binder(&self) -> &EndpointBinder {
        &self.binder
    }

    /// Shorthand for `binder().bind(..)`.
    pub fn bind(&self, endpoint: &Identity, alias: &Identity) {
        self.binder.bind(endpoint, alias);
    }

    /// Open a session from endpoint `from` to whoever serves `to`.
    pub async fn open(
        &self,
        from: &Identity,
        to: &Identity,
    ) -> Result<Arc<dyn Session>, SessionError> {
        let endpoint = self.binder.resolve(to);
        let inbox = self
            .inboxes
            .get(&endpoint)
            .map(|s| s.value().clone())
            .ok_or_else(|| SessionError::UnknownEndpoint(to.clone()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let (mine, theirs) =
            ChannelSession::pair(id.clone(), from.clone(), endpoint.clone(), SessionKind::Network);
        inbox
            .send(Arc::new(theirs))
            .await
            .map_err(|_| SessionError::UnknownEndpoint(to.clone()))?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, from = %from, to = %endpoint, "session opened");
        Ok(Arc::new(mine))
    }

    /// Number of network sessions opened so far.
    pub fn opened_sessions(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
}
