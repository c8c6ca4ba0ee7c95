//! Hub-side test client.
//!
//! [`TestClient`] registers a [`Connection`] directly with a hub and reads
//! what the hub writes into its outbound queue, standing in for the
//! WebSocket writer.

use collab_service::hub::{
    CloseReason, Connection, ConnectionId, ConnectionLink, ConnectionReceiver, HubHandle,
    OutboundFrame, Participant, RoomId,
};
use collab_service::protocol::{Envelope, MessageType};
use collab_service::rate_limit::RateLimiter;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Queue bound used by [`TestClient::join`].
pub const TEST_QUEUE_CAPACITY: usize = 64;

/// How long to wait for an expected frame.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// How long to wait before concluding nothing is coming.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(50);

/// A participant connected straight to the hub.
pub struct TestClient {
    pub participant: Participant,
    pub room_id: RoomId,
    receiver: ConnectionReceiver,
}

impl TestClient {
    /// Register `participant` in `room_id`.
    ///
    /// # Panics
    ///
    /// Panics if the hub rejects the registration.
    pub async fn join(hub: &HubHandle, room_id: RoomId, participant: Participant) -> Self {
        Self::try_join_with_capacity(hub, room_id, participant, TEST_QUEUE_CAPACITY)
            .await
            .expect("registration rejected")
    }

    /// Register with an explicit outbound queue bound.
    pub async fn try_join_with_capacity(
        hub: &HubHandle,
        room_id: RoomId,
        participant: Participant,
        capacity: usize,
    ) -> Result<Self, collab_service::errors::CollabError> {
        let (connection, receiver) = Connection::new(
            participant.clone(),
            room_id,
            capacity,
            RateLimiter::default(),
        );
        hub.register(connection).await?;
        Ok(Self {
            participant,
            room_id,
            receiver,
        })
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.receiver.id()
    }

    #[must_use]
    pub fn user_id(&self) -> uuid::Uuid {
        self.participant.user_id
    }

    #[must_use]
    pub fn link(&self) -> Arc<ConnectionLink> {
        self.receiver.link()
    }

    /// Next outbound frame.
    ///
    /// # Panics
    ///
    /// Panics on timeout or if the queue is closed.
    pub async fn recv_frame(&mut self) -> OutboundFrame {
        tokio::time::timeout(RECV_TIMEOUT, self.receiver.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection queue closed")
    }

    /// Next envelope, skipping heartbeat pings.
    ///
    /// # Panics
    ///
    /// Panics on timeout, a closed queue, or an undecodable frame.
    pub async fn recv_envelope(&mut self) -> Envelope {
        loop {
            match self.recv_frame().await {
                OutboundFrame::Text(bytes) => {
                    return Envelope::from_frame(&bytes).expect("hub sent an invalid envelope")
                }
                OutboundFrame::Ping => continue,
            }
        }
    }

    /// Next envelope, asserting its type.
    ///
    /// # Panics
    ///
    /// Panics if the next envelope has a different type.
    pub async fn expect_kind(&mut self, kind: MessageType) -> Envelope {
        let envelope = self.recv_envelope().await;
        assert_eq!(envelope.kind, kind, "unexpected envelope: {envelope:?}");
        envelope
    }

    /// Assert nothing (except pings) arrives within [`SILENCE_WINDOW`].
    ///
    /// # Panics
    ///
    /// Panics if an envelope arrives.
    pub async fn expect_silence(&mut self) {
        let deadline = tokio::time::Instant::now() + SILENCE_WINDOW;
        loop {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Err(_) | Ok(None) => return,
                Ok(Some(OutboundFrame::Ping)) => continue,
                Ok(Some(OutboundFrame::Text(bytes))) => {
                    panic!(
                        "expected silence, got {}",
                        String::from_utf8_lossy(&bytes)
                    )
                }
            }
        }
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Wait until the hub closes this connection and return the reason.
    ///
    /// # Panics
    ///
    /// Panics if the connection is not closed within [`RECV_TIMEOUT`].
    pub async fn expect_closed(&self) -> CloseReason {
        let link = self.receiver.link();
        tokio::time::timeout(RECV_TIMEOUT, link.closed())
            .await
            .expect("connection was not closed");
        link.close_reason().expect("closed without a reason")
    }

    /// Broadcast `data` as this client, the way the transport reader does.
    ///
    /// # Panics
    ///
    /// Panics if the hub is gone.
    pub async fn send(&self, hub: &HubHandle, kind: MessageType, data: Value) {
        let envelope = Envelope::from_parts(kind, data, Some(self.user_id()), self.room_id);
        hub.broadcast(self.room_id, envelope, Some(self.id()))
            .await
            .expect("broadcast failed");
    }

    /// Leave the room as a disconnecting client would.
    pub async fn leave(self, hub: &HubHandle) {
        hub.unregister(self.id(), CloseReason::Normal).await;
    }
}
