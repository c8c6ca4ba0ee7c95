//! Per-socket connection state.
//!
//! A [`Connection`] is created by the transport adapter and handed to the hub
//! on registration; from then on the hub is its only owner. The transport
//! keeps the other half, a [`ConnectionReceiver`], which drains the bounded
//! outbound queue into the socket.
//!
//! State the transport's reader and writer also need (liveness, the close
//! reason, the rate limiter, a cancellation token) lives in a shared
//! [`ConnectionLink`] so that it never has to be routed through the hub.
//!
//! # Close semantics
//!
//! Only the hub closes a connection. Closing records the reason (first
//! writer wins), drops the outbound sender, and cancels the link token so the
//! writer emits a close frame immediately. Closing twice is a no-op.

use crate::protocol::{Cursor, PresenceEntry};
use crate::rate_limit::RateLimiter;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Connection identifier, unique per socket.
pub type ConnectionId = Uuid;

/// Room identifier (the project id).
pub type RoomId = Uuid;

/// Reason a connection was closed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Client went away or the transport failed.
    Normal,
    /// Hub is shutting down.
    ServerShutdown,
    /// No liveness signal within the staleness threshold.
    Stale,
    /// Outbound queue overflowed.
    SlowConsumer,
    /// Token missing, invalid, or expired.
    Unauthorized,
    /// Access to the room was denied.
    Forbidden,
    /// A required frame could not be decoded.
    ProtocolError,
    /// Unexpected server-side failure.
    InternalError,
}

impl CloseReason {
    /// WebSocket close code.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::ServerShutdown => 1001,
            CloseReason::InternalError => 1011,
            CloseReason::Stale => 4000,
            CloseReason::Unauthorized => 4001,
            CloseReason::ProtocolError => 4002,
            CloseReason::Forbidden => 4003,
            CloseReason::SlowConsumer => 4008,
        }
    }

    /// Close reason text sent to the peer.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::ServerShutdown => "server shutting down",
            CloseReason::Stale => "heartbeat timeout",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Unauthorized => "unauthorized",
            CloseReason::Forbidden => "forbidden",
            CloseReason::ProtocolError => "protocol error",
            CloseReason::InternalError => "internal error",
        }
    }

    /// Label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::ServerShutdown => "shutdown",
            CloseReason::Stale => "stale",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::Unauthorized => "unauthorized",
            CloseReason::Forbidden => "forbidden",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::InternalError => "internal_error",
        }
    }
}

/// Item in a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Encoded envelope, sent as a text frame.
    Text(Bytes),
    /// Heartbeat; the writer sends a transport-level ping.
    Ping,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame is in the queue.
    Enqueued,
    /// Queue was full; the frame was dropped.
    Dropped,
    /// Connection is already closed.
    Closed,
}

/// Authenticated identity of the user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    /// Display color (`#RRGGBB`).
    pub color: String,
}

/// State shared between the hub-owned [`Connection`] and the transport tasks.
#[derive(Debug)]
pub struct ConnectionLink {
    /// Reference point for the liveness clock.
    epoch: Instant,
    /// Milliseconds since `epoch` at the last liveness signal.
    last_seen_ms: AtomicU64,
    /// Set once, by whoever closes first.
    close_reason: OnceLock<CloseReason>,
    /// Cancelled when the connection is closed.
    cancel_token: CancellationToken,
    /// Inbound admission control.
    limiter: RateLimiter,
}

impl ConnectionLink {
    fn new(limiter: RateLimiter) -> Self {
        Self {
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            close_reason: OnceLock::new(),
            cancel_token: CancellationToken::new(),
            limiter,
        }
    }

    /// Record a liveness signal (any inbound frame or pong).
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last liveness signal.
    #[must_use]
    pub fn idle(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last_seen)
    }

    /// Wall-clock time of the last liveness signal.
    #[must_use]
    pub fn last_seen(&self) -> DateTime<Utc> {
        let idle = chrono::Duration::from_std(self.idle()).unwrap_or(chrono::Duration::zero());
        Utc::now() - idle
    }

    /// Record why the connection is closing. Later calls are ignored.
    pub fn record_close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
    }

    /// Recorded close reason, if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }

    /// Per-connection rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Hub-owned connection state.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    participant: Participant,
    room_id: RoomId,
    /// `None` once closed.
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    link: Arc<ConnectionLink>,
    /// Last cursor position reported by the client.
    cursor: Option<Cursor>,
    joined_at: DateTime<Utc>,
}

/// Transport-owned half of a connection: the outbound queue's receiver.
#[derive(Debug)]
pub struct ConnectionReceiver {
    id: ConnectionId,
    receiver: mpsc::Receiver<OutboundFrame>,
    link: Arc<ConnectionLink>,
}

impl Connection {
    /// Create a connection with a bounded outbound queue.
    ///
    /// A zero `queue_capacity` is raised to one.
    #[must_use]
    pub fn new(
        participant: Participant,
        room_id: RoomId,
        queue_capacity: usize,
        limiter: RateLimiter,
    ) -> (Self, ConnectionReceiver) {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let link = Arc::new(ConnectionLink::new(limiter));

        let connection = Self {
            id,
            participant,
            room_id,
            outbound: Some(sender),
            link: Arc::clone(&link),
            cursor: None,
            joined_at: Utc::now(),
        };
        let receiver = ConnectionReceiver { id, receiver, link };

        (connection, receiver)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.participant.user_id
    }

    #[must_use]
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    #[must_use]
    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    #[must_use]
    pub fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
    }

    /// Enqueue without waiting. A full queue drops the frame.
    pub fn send(&self, frame: OutboundFrame) -> SendOutcome {
        let Some(sender) = &self.outbound else {
            return SendOutcome::Closed;
        };
        match sender.try_send(frame) {
            Ok(()) => SendOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Whether no liveness signal arrived within `threshold`.
    #[must_use]
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.link.idle() > threshold
    }

    /// Close the outbound queue and signal the transport.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.outbound.take().is_none() {
            return false;
        }
        self.link.record_close(reason);
        self.link.cancel();
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_none()
    }

    /// Presence view of this connection.
    #[must_use]
    pub fn presence_entry(&self) -> PresenceEntry {
        PresenceEntry {
            user_id: self.participant.user_id,
            display_name: self.participant.display_name.clone(),
            color: self.participant.color.clone(),
            cursor: self.cursor,
            last_seen: self.link.last_seen(),
        }
    }
}

impl ConnectionReceiver {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn link(&self) -> Arc<ConnectionLink> {
        Arc::clone(&self.link)
    }

    /// Next outbound frame; `None` once the hub has closed the connection
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`ConnectionReceiver::recv`].
    pub fn try_recv(&mut self) -> Result<OutboundFrame, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}
