//! WebSocket client connection state.
//!
//! A [`Connection`] is created once per accepted socket and shared as
//! `Arc<Connection>` between the registry, the broadcaster, the liveness
//! monitor and the socket's own read loop. Identity, metadata and the
//! subscribed topic never change after creation; only the liveness timestamp
//! and the close state are mutable.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::constants::close_code;
use relay_core::{ConnectionId, PrincipalId, TopicId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::auth::Identity;
use crate::errors::DeliveryError;

/// One item on a connection's outbound queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A JSON text frame.
    Frame(Arc<String>),
    /// A liveness probe: the heartbeat text frame followed by a Ping.
    Probe(Arc<String>),
}

/// Why a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Client left or the socket ended.
    Normal,
    /// Server is shutting down.
    ShuttingDown,
    /// A send failed or timed out.
    SendFailed,
    /// No liveness acknowledgement within the deadline.
    LivenessTimeout,
    /// Subscription refused during the handshake; carries the close code.
    Refused(u16),
}

impl CloseReason {
    /// WebSocket close code.
    pub const fn code(self) -> u16 {
        match self {
            Self::Normal => close_code::NORMAL,
            Self::ShuttingDown => close_code::GOING_AWAY,
            Self::SendFailed => close_code::INTERNAL_ERROR,
            Self::LivenessTimeout => close_code::POLICY_VIOLATION,
            Self::Refused(code) => code,
        }
    }

    /// Short label used for the close frame reason and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::ShuttingDown => "shutting_down",
            Self::SendFailed => "send_failed",
            Self::LivenessTimeout => "liveness_timeout",
            Self::Refused(_) => "subscription_refused",
        }
    }
}

/// Represents a connected WebSocket client.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    metadata: HashMap<String, String>,
    /// Set exactly once, by the registry on join.
    topic: OnceLock<TopicId>,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Outbound>,
    connected_at: DateTime<Utc>,
    started: Instant,
    last_liveness: Mutex<Instant>,
    closed: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl Connection {
    /// Create a connection for an authenticated identity.
    pub fn new(id: ConnectionId, identity: Identity, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            metadata: HashMap::new(),
            topic: OnceLock::new(),
            tx,
            connected_at: Utc::now(),
            started: now,
            last_liveness: Mutex::new(now),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
        }
    }

    /// Attach client-supplied annotations. Only usable before sharing.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Identity supplied by the authenticator.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Authenticated principal.
    pub fn principal_id(&self) -> PrincipalId {
        self.identity.principal_id
    }

    /// Whether the principal is an administrator.
    pub fn is_admin(&self) -> bool {
        self.identity.is_admin
    }

    /// Client annotations.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Topic this connection joined, if it has joined one.
    pub fn topic(&self) -> Option<&TopicId> {
        self.topic.get()
    }

    /// Record the joined topic. Fails with the existing topic if already set.
    pub(crate) fn bind_topic(&self, topic: TopicId) -> Result<(), TopicId> {
        self.topic.set(topic).map_err(|_| {
            self.topic
                .get()
                .cloned()
                .unwrap_or_else(TopicId::global)
        })
    }

    /// Wall-clock time the connection was accepted.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Push a frame, waiting at most `timeout` for queue space.
    pub async fn deliver(&self, frame: Arc<String>, timeout: Duration) -> Result<(), DeliveryError> {
        self.send_timeout(Outbound::Frame(frame), timeout).await
    }

    /// Push a liveness probe, waiting at most `timeout` for queue space.
    pub async fn probe(&self, frame: Arc<String>, timeout: Duration) -> Result<(), DeliveryError> {
        self.send_timeout(Outbound::Probe(frame), timeout).await
    }

    /// Push a frame without waiting.
    pub fn enqueue(&self, frame: Arc<String>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(Outbound::Frame(frame)).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    async fn send_timeout(&self, item: Outbound, timeout: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.send_timeout(item, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => DeliveryError::TimedOut,
            SendTimeoutError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Record a liveness acknowledgement from the peer.
    pub fn mark_alive(&self) {
        *self.last_liveness.lock() = Instant::now();
    }

    /// Time since the last liveness acknowledgement (or since connect).
    pub fn last_liveness_elapsed(&self) -> Duration {
        self.last_liveness.lock().elapsed()
    }

    /// Release the transport. Returns `true` if this call closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.closed.cancel();
        true
    }

    /// Whether the transport has been released.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Reason given to the first [`close`](Self::close) call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("principal_id", &self.identity.principal_id)
            .field("topic", &self.topic.get())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::connection;
    use super::*;

    #[test]
    fn create_connection() {
        let (conn, _rx) = connection("conn_1", 7, 8);
        assert_eq!(conn.id().as_str(), "conn_1");
        assert_eq!(conn.principal_id(), PrincipalId::new(7));
        assert!(!conn.is_admin());
        assert!(conn.topic().is_none());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn deliver_success() {
        let (conn, mut rx) = connection("c", 1, 8);
        conn.deliver(Arc::new("hello".into()), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Frame(Arc::new("hello".into()))));
    }

    #[tokio::test]
    async fn deliver_to_dropped_receiver_is_closed() {
        let (conn, rx) = connection("c", 1, 8);
        drop(rx);
        let err = conn
            .deliver(Arc::new("x".into()), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_to_full_queue_times_out() {
        let (conn, _rx) = connection("c", 1, 1);
        conn.enqueue(Arc::new("first".into())).unwrap();
        let err = conn
            .deliver(Arc::new("second".into()), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::TimedOut);
    }

    #[test]
    fn enqueue_full_queue() {
        let (conn, _rx) = connection("c", 1, 1);
        conn.enqueue(Arc::new("a".into())).unwrap();
        assert_eq!(conn.enqueue(Arc::new("b".into())), Err(DeliveryError::QueueFull));
    }

    #[tokio::test]
    async fn probe_is_tagged() {
        let (conn, mut rx) = connection("c", 1, 8);
        conn.probe(Arc::new("hb".into()), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Outbound::Probe(_))));
    }

    #[test]
    fn bind_topic_only_once() {
        let (conn, _rx) = connection("c", 1, 8);
        conn.bind_topic(TopicId::global()).unwrap();
        let existing = conn.bind_topic(TopicId::user(PrincipalId::new(1))).unwrap_err();
        assert_eq!(existing, TopicId::global());
        assert_eq!(conn.topic(), Some(&TopicId::global()));
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_reason() {
        let (conn, _rx) = connection("c", 1, 8);
        assert!(conn.close(CloseReason::SendFailed));
        assert!(!conn.close(CloseReason::Normal));
        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::SendFailed));
    }

    #[test]
    fn closed_connection_rejects_sends() {
        let (conn, _rx) = connection("c", 1, 8);
        let _ = conn.close(CloseReason::Normal);
        assert_eq!(conn.enqueue(Arc::new("a".into())), Err(DeliveryError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn mark_alive_resets_elapsed() {
        let (conn, _rx) = connection("c", 1, 8);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(conn.last_liveness_elapsed() >= Duration::from_secs(10));
        conn.mark_alive();
        assert!(conn.last_liveness_elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn close_reason_codes() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::ShuttingDown.code(), 1001);
        assert_eq!(CloseReason::SendFailed.code(), 1011);
        assert_eq!(CloseReason::LivenessTimeout.code(), 1008);
        assert_eq!(CloseReason::Refused(4003).code(), 4003);
    }
}
