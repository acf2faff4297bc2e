//! Channel-backed sessions: two bounded tokio mpsc queues, one per
//! direction.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Message, MessageStatus, Session, SessionError, SessionInfo, SessionKind};
use crate::config::SESSION_QUEUE_CAPACITY;
use crate::identity::Identity;

/// One end of a channel-backed session.
pub struct ChannelSession {
    info: SessionInfo,
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl ChannelSession {
    /// Build both ends of a session between `a` and `b`. The first
    /// returned end belongs to `a`.
    pub fn pair(id: String, a: Identity, b: Identity, kind: SessionKind) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let a_end = Self {
            info: SessionInfo {
                id: id.clone(),
                local: a.clone(),
                remote: b.clone(),
                kind,
            },
            outgoing: Mutex::new(Some(a_tx)),
            incoming: tokio::sync::Mutex::new(a_rx),
        };
        let b_end = Self {
            info: SessionInfo {
                id,
                local: b,
                remote: a,
                kind,
            },
            outgoing: Mutex::new(Some(b_tx)),
            incoming: tokio::sync::Mutex::new(b_rx),
        };
        (a_end, b_end)
    }

    /// A self-loop session pair for `me`. Never touches a hub.
    pub fn self_pair(me: &Identity) -> (Self, Self) {
        let id = format!("self-{}", uuid::Uuid::new_v4());
        debug!(session_id = %id, party = %me, "opening self session");
        Self::pair(id, me.clone(), me.clone(), SessionKind::SelfLoop)
    }

    async fn push(&self, status: MessageStatus, payload: Bytes) -> Result<(), SessionError> {
        let sender = self
            .outgoing
            .lock()
            .clone()
            .ok_or_else(|| SessionError::Closed(self.info.id.clone()))?;
        let msg = Message {
            session_id: self.info.id.clone(),
            caller: self.info.local.clone(),
            status,
            payload,
        };
        sender
            .send(msg)
            .await
            .map_err(|_| SessionError::Closed(self.info.id.clone()))
    }
}

#[async_trait]
impl Session for ChannelSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        self.push(MessageStatus::Ok, payload).await
    }

    async fn send_error(&self, reason: &str) -> Result<(), SessionError> {
        self.push(MessageStatus::Error, Bytes::copy_from_slice(reason.as_bytes()))
            .await
    }

    async fn receive(&self, timeout: Duration) -> Result<Message, SessionError> {
        let mut rx = self.incoming.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(SessionError::Closed(self.info.id.clone())),
            Err(_) => Err(SessionError::Timeout {
                session_id: self.info.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn close(&self) {
        if self.outgoing.lock().take().is_some() {
            debug!(session_id = %self.info.id, "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{receive_json, receive_raw, send_json};

    fn ids() -> (Identity, Identity) {
        (Identity::from_bytes(vec![1]), Identity::from_bytes(vec![2]))
    }

    #[tokio::test]
    async fn messages_flow_both_ways_in_order() {
        let (a, b) = ids();
        let (sa, sb) = ChannelSession::pair("s1".into(), a.clone(), b, SessionKind::Network);

        sa.send(Bytes::from_static(b"one")).await.unwrap();
        sa.send(Bytes::from_static(b"two")).await.unwrap();
        let m1 = sb.receive(Duration::from_secs(1)).await.unwrap();
        let m2 = sb.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&m1.payload[..], b"one");
        assert_eq!(&m2.payload[..], b"two");
        assert_eq!(m1.caller, a);

        send_json(&sb, &vec![1u32, 2, 3]).await.unwrap();
        let back: Vec<u32> = receive_json(&sa, Duration::from_secs(1)).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn receive_times_out() {
        let (a, b) = ids();
        let (sa, _sb) = ChannelSession::pair("s2".into(), a, b, SessionKind::Network);
        let err = sa.receive(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn error_status_becomes_remote_error() {
        let (a, b) = ids();
        let (sa, sb) = ChannelSession::pair("s3".into(), a, b, SessionKind::Network);
        sb.send_error("limit exceeded").await.unwrap();
        match receive_raw(&sa, Duration::from_secs(1)).await {
            Err(SessionError::Remote(reason)) => assert_eq!(reason, "limit exceeded"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn close_is_observed_by_peer_after_drain() {
        let (a, b) = ids();
        let (sa, sb) = ChannelSession::pair("s4".into(), a, b, SessionKind::Network);
        sa.send(Bytes::from_static(b"last")).await.unwrap();
        sa.close().await;
        sa.close().await;

        assert!(sb.receive(Duration::from_secs(1)).await.is_ok());
        assert!(matches!(
            sb.receive(Duration::from_secs(1)).await,
            Err(SessionError::Closed(_))
        ));
        assert!(matches!(
            sa.send(Bytes::new()).await,
            Err(SessionError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn self_pair_is_tagged() {
        let me = Identity::from_bytes(vec![7]);
        let (x, y) = ChannelSession::self_pair(&me);
        assert_eq!(x.info().kind, SessionKind::SelfLoop);
        assert_eq!(x.info().local, y.info().local);
        x.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&y.receive(Duration::from_secs(1)).await.unwrap().payload[..], b"ping");
    }
}
