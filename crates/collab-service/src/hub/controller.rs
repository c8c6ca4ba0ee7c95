//! `HubActor` - the single control loop that owns all room state.
//!
//! Every room mutation and every fan-out runs on this loop, so the
//! lookup, mutate and notify steps of one event never interleave with
//! another event touching the same room. Other tasks talk to the hub only
//! through a cloneable [`HubHandle`].
//!
//! The loop multiplexes four sources:
//! - the mailbox (register, unregister, broadcast, queries, shutdown),
//! - foreign frames delivered by the bridge,
//! - the heartbeat ticker,
//! - the root cancellation token.
//!
//! Sends into connection queues never wait. A member whose queue is full is
//! unregistered with [`CloseReason::SlowConsumer`] instead of stalling the
//! room.

use super::connection::{CloseReason, Connection, ConnectionId, OutboundFrame, RoomId, SendOutcome};
use super::messages::{ForeignMessage, HubMessage, HubStatus};
use crate::bridge::Bridge;
use crate::errors::CollabError;
use crate::observability::metrics;
use crate::protocol::{
    Envelope, MessageType, PresenceEntry, PresenceSnapshot, UserCursor, UserJoined, UserLeft,
};

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default heartbeat sweep interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default staleness threshold.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

/// Channel buffer size for the hub mailbox.
const HUB_CHANNEL_BUFFER: usize = 1024;

/// Channel buffer size for frames arriving from the bridge.
const FOREIGN_CHANNEL_BUFFER: usize = 1024;

/// Hub timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Handle to the `HubActor`.
///
/// Cheap to clone; every connection task holds one.
#[derive(Clone, Debug)]
pub struct HubHandle {
    sender: mpsc::Sender<HubMessage>,
    cancel_token: CancellationToken,
    /// Flipped by the actor when shutdown begins; closed when it exits.
    draining: watch::Receiver<bool>,
}

impl HubHandle {
    /// Spawn the hub actor.
    ///
    /// Returns the handle and the actor's join handle.
    #[must_use]
    pub fn spawn(config: HubConfig, bridge: Arc<dyn Bridge>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(HUB_CHANNEL_BUFFER);
        let (foreign_tx, foreign_rx) = mpsc::channel(FOREIGN_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let (draining_tx, draining) = watch::channel(false);

        let actor = HubActor {
            receiver,
            foreign_rx,
            foreign_tx,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            index: HashMap::new(),
            draining: false,
            draining_tx,
            bridge,
            config,
        };

        let task_handle = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
                draining,
            },
            task_handle,
        )
    }

    /// Register a connection in its room.
    ///
    /// Fails with [`CollabError::Draining`] once shutdown has begun.
    pub async fn register(&self, connection: Connection) -> Result<(), CollabError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::Register {
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| CollabError::Draining)?;

        rx.await
            .map_err(|e| CollabError::Internal(format!("response receive failed: {e}")))?
    }

    /// Unregister a connection. Unknown ids and a stopped hub are ignored.
    pub async fn unregister(&self, connection_id: ConnectionId, reason: CloseReason) {
        let _ = self
            .sender
            .send(HubMessage::Unregister {
                connection_id,
                reason,
            })
            .await;
    }

    /// Fan `envelope` out to `room_id`, skipping `except`.
    pub async fn broadcast(
        &self,
        room_id: RoomId,
        envelope: Envelope,
        except: Option<ConnectionId>,
    ) -> Result<(), CollabError> {
        self.sender
            .send(HubMessage::Broadcast {
                room_id,
                envelope,
                except,
            })
            .await
            .map_err(|e| CollabError::Internal(format!("channel send failed: {e}")))
    }

    /// Broadcast an accepted edit on behalf of a collaborating service.
    ///
    /// Every member of the room receives it, including connections of the
    /// acting user.
    pub async fn notify<P: Serialize>(
        &self,
        room_id: RoomId,
        kind: MessageType,
        payload: &P,
        actor_user_id: Option<Uuid>,
    ) -> Result<(), CollabError> {
        let envelope = Envelope::encode(kind, payload, actor_user_id, room_id)?;
        self.broadcast(room_id, envelope, None).await
    }

    /// Presence snapshot of a room (empty for unknown rooms).
    pub async fn presence(&self, room_id: RoomId) -> Result<Vec<PresenceEntry>, CollabError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::Presence {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CollabError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CollabError::Internal(format!("response receive failed: {e}")))
    }

    /// Number of connections in a room.
    pub async fn room_size(&self, room_id: RoomId) -> Result<usize, CollabError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::RoomSize {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CollabError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CollabError::Internal(format!("response receive failed: {e}")))
    }

    /// Current hub status.
    pub async fn status(&self) -> Result<HubStatus, CollabError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| CollabError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CollabError::Internal(format!("response receive failed: {e}")))
    }

    /// Drain the hub: reject new registrations, cancel bridge subscriptions,
    /// close every connection.
    ///
    /// Idempotent; succeeds if the hub has already stopped.
    pub async fn shutdown(&self) -> Result<(), CollabError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(HubMessage::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Stop the actor after draining.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the actor task is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.draining.has_changed().is_ok()
    }

    /// Whether shutdown has begun. A stopped actor counts as draining.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        *self.draining.borrow() || !self.is_running()
    }
}

/// Members of one room. Exists only while non-empty.
#[derive(Debug, Default)]
struct Room {
    members: HashMap<ConnectionId, Connection>,
}

/// The hub actor. Owns every registered [`Connection`].
struct HubActor {
    receiver: mpsc::Receiver<HubMessage>,
    foreign_rx: mpsc::Receiver<ForeignMessage>,
    /// Cloned into each bridge subscription.
    foreign_tx: mpsc::Sender<ForeignMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<RoomId, Room>,
    /// Connection id to room id.
    index: HashMap<ConnectionId, RoomId>,
    draining: bool,
    draining_tx: watch::Sender<bool>,
    bridge: Arc<dyn Bridge>,
    config: HubConfig,
}

/// Members to unregister after a fan-out, with the reason.
type Evictions = Vec<(ConnectionId, CloseReason)>;

impl HubActor {
    #[instrument(skip_all, name = "collab.hub", fields(bridge = self.bridge.is_enabled()))]
    async fn run(mut self) {
        info!(
            target: "collab.hub",
            heartbeat_secs = self.config.heartbeat_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Hub started"
        );

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "collab.hub", "Hub received cancellation signal");
                    self.shutdown();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message),
                        None => {
                            info!(target: "collab.hub", "Hub mailbox closed, exiting");
                            self.shutdown();
                            break;
                        }
                    }
                }

                Some(foreign) = self.foreign_rx.recv() => {
                    self.deliver_foreign(foreign);
                }

                _ = heartbeat.tick() => {
                    self.heartbeat_sweep();
                }
            }
        }

        info!(target: "collab.hub", "Hub stopped");
    }

    fn handle_message(&mut self, message: HubMessage) {
        match message {
            HubMessage::Register {
                connection,
                respond_to,
            } => {
                let result = self.register(connection);
                let _ = respond_to.send(result);
            }

            HubMessage::Unregister {
                connection_id,
                reason,
            } => {
                self.evict(vec![(connection_id, reason)]);
            }

            HubMessage::Broadcast {
                room_id,
                envelope,
                except,
            } => {
                self.broadcast(room_id, envelope, except);
            }

            HubMessage::Presence {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.presence(room_id));
            }

            HubMessage::RoomSize {
                room_id,
                respond_to,
            } => {
                let size = self.rooms.get(&room_id).map_or(0, |room| room.members.len());
                let _ = respond_to.send(size);
            }

            HubMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(HubStatus {
                    room_count: self.rooms.len(),
                    connection_count: self.index.len(),
                    is_draining: self.draining,
                    bridge_enabled: self.bridge.is_enabled(),
                });
            }

            HubMessage::Shutdown { respond_to } => {
                self.shutdown();
                let _ = respond_to.send(());
            }
        }
    }

    fn register(&mut self, mut connection: Connection) -> Result<(), CollabError> {
        if self.draining {
            connection.close(CloseReason::ServerShutdown);
            return Err(CollabError::Draining);
        }

        let room_id = connection.room_id();
        let connection_id = connection.id();
        let participant = connection.participant().clone();
        connection.link().touch();

        if !self.rooms.contains_key(&room_id) {
            self.rooms.insert(room_id, Room::default());
            if self.bridge.is_enabled() {
                self.bridge.subscribe(room_id, self.foreign_tx.clone());
            }
            debug!(target: "collab.hub", room_id = %room_id, "Room created");
        }

        let joined = UserJoined {
            user_id: participant.user_id,
            display_name: participant.display_name.clone(),
            color: participant.color.clone(),
        };
        let mut evictions = Evictions::new();
        match Envelope::encode(
            MessageType::UserJoined,
            &joined,
            Some(participant.user_id),
            room_id,
        ) {
            Ok(envelope) => evictions.extend(self.fan_out_and_publish(room_id, &envelope, None)),
            Err(e) => {
                error!(target: "collab.hub", error = %e, "Failed to encode user_joined");
            }
        }

        self.index.insert(connection_id, room_id);
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Err(CollabError::Internal("room vanished during register".to_string()));
        };
        room.members.insert(connection_id, connection);

        let snapshot = PresenceSnapshot {
            users: self.presence(room_id),
        };
        match Envelope::encode(MessageType::PresenceSnapshot, &snapshot, None, room_id)
            .and_then(|envelope| envelope.to_frame())
        {
            Ok(frame) => {
                if let Some(reason) = self.send_to(room_id, connection_id, frame) {
                    evictions.push((connection_id, reason));
                }
            }
            Err(e) => {
                error!(target: "collab.hub", error = %e, "Failed to encode presence_snapshot");
            }
        }

        info!(
            target: "collab.hub",
            room_id = %room_id,
            connection_id = %connection_id,
            user_id = %participant.user_id,
            room_size = self.rooms.get(&room_id).map_or(0, |r| r.members.len()),
            "Connection registered"
        );

        self.record_gauges();
        self.evict(evictions);
        Ok(())
    }

    /// Unregister connections, including any that overflow while being told
    /// about the departures.
    fn evict(&mut self, mut pending: Evictions) {
        while let Some((connection_id, reason)) = pending.pop() {
            pending.extend(self.remove_connection(connection_id, reason));
        }
        self.record_gauges();
    }

    fn remove_connection(&mut self, connection_id: ConnectionId, reason: CloseReason) -> Evictions {
        let Some(room_id) = self.index.remove(&connection_id) else {
            debug!(
                target: "collab.hub",
                connection_id = %connection_id,
                "Unregister for unknown connection ignored"
            );
            return Evictions::new();
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Evictions::new();
        };
        let Some(mut connection) = room.members.remove(&connection_id) else {
            return Evictions::new();
        };

        connection.close(reason);
        let room_empty = room.members.is_empty();

        info!(
            target: "collab.hub",
            room_id = %room_id,
            connection_id = %connection_id,
            user_id = %connection.user_id(),
            reason = reason.as_str(),
            "Connection unregistered"
        );

        if room_empty {
            self.rooms.remove(&room_id);
            if self.bridge.is_enabled() {
                self.bridge.unsubscribe(room_id);
            }
            debug!(target: "collab.hub", room_id = %room_id, "Room removed");
        }

        let left = UserLeft {
            user_id: connection.user_id(),
            display_name: connection.participant().display_name.clone(),
        };
        match Envelope::encode(MessageType::UserLeft, &left, Some(left.user_id), room_id) {
            Ok(envelope) => self.fan_out_and_publish(room_id, &envelope, None),
            Err(e) => {
                error!(target: "collab.hub", error = %e, "Failed to encode user_left");
                Evictions::new()
            }
        }
    }

    fn broadcast(&mut self, room_id: RoomId, envelope: Envelope, except: Option<ConnectionId>) {
        if self.draining {
            debug!(target: "collab.hub", room_id = %room_id, "Broadcast dropped while draining");
            return;
        }

        if envelope.kind == MessageType::UserCursor {
            self.record_cursor(room_id, &envelope, except);
        }

        let evictions = self.fan_out_and_publish(room_id, &envelope, except);
        self.evict(evictions);
    }

    fn record_cursor(&mut self, room_id: RoomId, envelope: &Envelope, sender: Option<ConnectionId>) {
        let Some(connection_id) = sender else {
            return;
        };
        let Ok(cursor) = envelope.decode::<UserCursor>(&MessageType::UserCursor) else {
            return;
        };
        if let Some(connection) = self
            .rooms
            .get_mut(&room_id)
            .and_then(|room| room.members.get_mut(&connection_id))
        {
            connection.set_cursor(cursor.position);
        }
    }

    /// Local fan-out followed by a fire-and-forget publish to the bridge.
    fn fan_out_and_publish(
        &self,
        room_id: RoomId,
        envelope: &Envelope,
        except: Option<ConnectionId>,
    ) -> Evictions {
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(target: "collab.hub", room_id = %room_id, error = %e, "Failed to encode envelope");
                return Evictions::new();
            }
        };

        let started = Instant::now();
        let evictions = self.fan_out(room_id, &frame, except, None);
        metrics::record_broadcast("local", started.elapsed());

        if self.bridge.is_enabled() {
            self.bridge.publish(room_id, envelope.user_id, frame);
        }

        evictions
    }

    /// Enqueue `frame` for every member of `room_id` except `except` and
    /// except connections belonging to `skip_user`.
    fn fan_out(
        &self,
        room_id: RoomId,
        frame: &Bytes,
        except: Option<ConnectionId>,
        skip_user: Option<Uuid>,
    ) -> Evictions {
        let Some(room) = self.rooms.get(&room_id) else {
            return Evictions::new();
        };

        let mut evictions = Evictions::new();
        for (connection_id, connection) in &room.members {
            if except == Some(*connection_id) || skip_user == Some(connection.user_id()) {
                continue;
            }
            if let Some(reason) = Self::deliver(connection, OutboundFrame::Text(frame.clone())) {
                evictions.push((*connection_id, reason));
            }
        }
        evictions
    }

    fn send_to(&self, room_id: RoomId, connection_id: ConnectionId, frame: Bytes) -> Option<CloseReason> {
        let connection = self.rooms.get(&room_id)?.members.get(&connection_id)?;
        Self::deliver(connection, OutboundFrame::Text(frame))
    }

    /// Non-blocking send; returns the close reason if the member must go.
    fn deliver(connection: &Connection, frame: OutboundFrame) -> Option<CloseReason> {
        match connection.send(frame) {
            SendOutcome::Enqueued => None,
            SendOutcome::Dropped => {
                metrics::record_message_dropped("queue_full");
                warn!(
                    target: "collab.hub",
                    connection_id = %connection.id(),
                    room_id = %connection.room_id(),
                    "Outbound queue full, dropping slow consumer"
                );
                Some(CloseReason::SlowConsumer)
            }
            SendOutcome::Closed => {
                metrics::record_message_dropped("closed");
                Some(CloseReason::Normal)
            }
        }
    }

    fn deliver_foreign(&mut self, message: ForeignMessage) {
        if self.draining {
            return;
        }

        let started = Instant::now();
        let evictions = self.fan_out(message.room_id, &message.frame, None, message.sender);
        metrics::record_broadcast("bridge", started.elapsed());

        self.evict(evictions);
    }

    fn presence(&self, room_id: RoomId) -> Vec<PresenceEntry> {
        let Some(room) = self.rooms.get(&room_id) else {
            return Vec::new();
        };
        let mut members: Vec<&Connection> = room.members.values().collect();
        members.sort_by_key(|connection| connection.joined_at());
        members.into_iter().map(Connection::presence_entry).collect()
    }

    /// Unregister stale members and ping the rest.
    fn heartbeat_sweep(&mut self) {
        let mut evictions = Evictions::new();
        for room in self.rooms.values() {
            for (connection_id, connection) in &room.members {
                if connection.is_stale(self.config.stale_after) {
                    debug!(
                        target: "collab.hub",
                        connection_id = %connection_id,
                        idle_secs = connection.link().idle().as_secs(),
                        "Connection stale"
                    );
                    evictions.push((*connection_id, CloseReason::Stale));
                } else if let Some(reason) = Self::deliver(connection, OutboundFrame::Ping) {
                    evictions.push((*connection_id, reason));
                }
            }
        }

        if !evictions.is_empty() {
            debug!(target: "collab.hub", count = evictions.len(), "Heartbeat sweep evicting connections");
        }
        self.evict(evictions);
    }

    fn shutdown(&mut self) {
        if self.draining {
            debug!(target: "collab.hub", "Shutdown already in progress");
            return;
        }
        self.draining = true;
        self.draining_tx.send_replace(true);

        info!(
            target: "collab.hub",
            rooms = self.rooms.len(),
            connections = self.index.len(),
            "Hub draining"
        );

        self.bridge.shutdown();

        for (_, room) in self.rooms.drain() {
            for (_, mut connection) in room.members {
                connection.close(CloseReason::ServerShutdown);
            }
        }
        self.index.clear();
        self.record_gauges();
    }

    fn record_gauges(&self) {
        metrics::set_connections_active(self.index.len());
        metrics::set_rooms_active(self.rooms.len());
    }
}
