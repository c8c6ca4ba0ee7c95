//! Medium-agnostic pub/sub bridge.
//!
//! Each non-empty room maps to one channel (`{prefix}{room_id}`) and at most
//! one listener task. Published frames are wrapped in a [`BridgeFrame`] that
//! names the originating instance; a listener drops frames carrying its own
//! instance id and forwards the rest to the hub as [`ForeignMessage`]s.
//! Foreign frames are never published again, so relays cannot loop.
//!
//! Publishing goes through a bounded queue drained by a single task. The hub
//! only ever does a `try_send`; a full queue or a medium error costs one
//! frame on other instances and nothing locally.
//!
//! A listener whose subscription fails or whose stream ends retries with
//! exponential backoff until its room is unsubscribed. While it is retrying
//! the room only sees local traffic.

use super::Bridge;
use crate::errors::CollabError;
use crate::hub::{ForeignMessage, RoomId};
use crate::observability::metrics;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel name prefix.
pub const DEFAULT_CHANNEL_PREFIX: &str = "collab:room:";

/// Capacity of the outgoing publish queue.
const PUBLISH_QUEUE_CAPACITY: usize = 1024;

/// First delay before re-subscribing after a failure.
const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound for the re-subscribe delay.
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A publish/subscribe transport (Redis, or an in-memory fake in tests).
#[async_trait]
pub trait PubSubMedium: Send + Sync + 'static {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CollabError>;

    /// Open a subscription. The stream ends when the subscription is lost;
    /// dropping it unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, CollabError>;
}

/// Payload carried on the medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeFrame {
    /// Instance id of the publisher.
    pub origin: String,
    /// User id of the original sender, if any.
    #[serde(default)]
    pub sender: Option<Uuid>,
    /// Encoded envelope.
    pub frame: String,
}

struct PublishJob {
    channel: String,
    payload: Vec<u8>,
}

/// One room's listener registration. `id` tells a listener apart from a
/// later one registered for the same room.
struct Subscription {
    id: Uuid,
    cancel_token: CancellationToken,
}

type SubscriptionMap = Arc<Mutex<HashMap<RoomId, Subscription>>>;

fn lock_map(map: &SubscriptionMap) -> MutexGuard<'_, HashMap<RoomId, Subscription>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Bridge`] implementation over any [`PubSubMedium`].
pub struct PubSubBridge<M: PubSubMedium> {
    medium: Arc<M>,
    instance_id: String,
    channel_prefix: String,
    subscriptions: SubscriptionMap,
    publish_tx: mpsc::Sender<PublishJob>,
    /// Parent of every subscription token and of the publisher task.
    cancel_token: CancellationToken,
}

impl<M: PubSubMedium> PubSubBridge<M> {
    /// Create the bridge and spawn its publisher task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(medium: Arc<M>, instance_id: impl Into<String>, channel_prefix: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        let cancel_token = CancellationToken::new();
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);

        tokio::spawn(run_publisher(
            Arc::clone(&medium),
            publish_rx,
            cancel_token.child_token(),
        ));

        info!(
            target: "collab.bridge",
            instance_id = %instance_id,
            "Pub/sub bridge started"
        );

        Self {
            medium,
            instance_id,
            channel_prefix: channel_prefix.into(),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            publish_tx,
            cancel_token,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Channel used for `room_id`.
    #[must_use]
    pub fn channel_for(&self, room_id: RoomId) -> String {
        format!("{}{room_id}", self.channel_prefix)
    }

    /// Number of rooms with an active subscription.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock_subscriptions().len()
    }

    /// Whether `room_id` has an active subscription.
    #[must_use]
    pub fn is_subscribed(&self, room_id: RoomId) -> bool {
        self.lock_subscriptions().contains_key(&room_id)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<RoomId, Subscription>> {
        lock_map(&self.subscriptions)
    }
}

impl<M: PubSubMedium> Bridge for PubSubBridge<M> {
    fn is_enabled(&self) -> bool {
        true
    }

    fn publish(&self, room_id: RoomId, sender: Option<Uuid>, frame: Bytes) {
        if self.cancel_token.is_cancelled() {
            return;
        }

        let Ok(text) = std::str::from_utf8(&frame) else {
            warn!(target: "collab.bridge", room_id = %room_id, "Refusing to publish non-UTF-8 frame");
            return;
        };
        let wrapped = BridgeFrame {
            origin: self.instance_id.clone(),
            sender,
            frame: text.to_string(),
        };
        let payload = match serde_json::to_vec(&wrapped) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "collab.bridge", error = %e, "Failed to encode bridge frame");
                return;
            }
        };

        let job = PublishJob {
            channel: self.channel_for(room_id),
            payload,
        };
        if let Err(e) = self.publish_tx.try_send(job) {
            metrics::record_bridge_publish_failure();
            warn!(
                target: "collab.bridge",
                room_id = %room_id,
                error = %e,
                "Publish queue unavailable, frame not relayed"
            );
        }
    }

    fn subscribe(&self, room_id: RoomId, sink: mpsc::Sender<ForeignMessage>) {
        if self.cancel_token.is_cancelled() {
            return;
        }

        let mut subscriptions = self.lock_subscriptions();
        if subscriptions.contains_key(&room_id) {
            debug!(target: "collab.bridge", room_id = %room_id, "Already subscribed");
            return;
        }

        let id = Uuid::new_v4();
        let token = self.cancel_token.child_token();
        subscriptions.insert(
            room_id,
            Subscription {
                id,
                cancel_token: token.clone(),
            },
        );
        drop(subscriptions);

        tokio::spawn(run_listener(ListenerContext {
            medium: Arc::clone(&self.medium),
            channel: self.channel_for(room_id),
            room_id,
            subscription_id: id,
            subscriptions: Arc::clone(&self.subscriptions),
            instance_id: self.instance_id.clone(),
            sink,
            cancel_token: token,
        }));

        debug!(target: "collab.bridge", room_id = %room_id, "Subscribed");
    }

    fn unsubscribe(&self, room_id: RoomId) {
        if let Some(subscription) = self.lock_subscriptions().remove(&room_id) {
            subscription.cancel_token.cancel();
            debug!(target: "collab.bridge", room_id = %room_id, "Unsubscribed");
        }
    }

    fn shutdown(&self) {
        self.cancel_token.cancel();
        let cancelled = {
            let mut subscriptions = self.lock_subscriptions();
            let count = subscriptions.len();
            subscriptions.clear();
            count
        };
        info!(
            target: "collab.bridge",
            subscriptions = cancelled,
            "Pub/sub bridge shut down"
        );
    }
}

impl<M: PubSubMedium> fmt::Debug for PubSubBridge<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubBridge")
            .field("instance_id", &self.instance_id)
            .field("channel_prefix", &self.channel_prefix)
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

#[instrument(skip_all, name = "collab.bridge.publisher")]
async fn run_publisher<M: PubSubMedium>(
    medium: Arc<M>,
    mut jobs: mpsc::Receiver<PublishJob>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            job = jobs.recv() => {
                let Some(job) = job else { break };
                if let Err(e) = medium.publish(&job.channel, job.payload).await {
                    metrics::record_bridge_publish_failure();
                    warn!(
                        target: "collab.bridge",
                        error = %e,
                        "Publish failed, continuing without relay"
                    );
                }
            }
        }
    }
    debug!(target: "collab.bridge", "Publisher stopped");
}

struct ListenerContext<M: PubSubMedium> {
    medium: Arc<M>,
    channel: String,
    room_id: RoomId,
    subscription_id: Uuid,
    subscriptions: SubscriptionMap,
    instance_id: String,
    sink: mpsc::Sender<ForeignMessage>,
    cancel_token: CancellationToken,
}

impl<M: PubSubMedium> ListenerContext<M> {
    /// Drop this listener's map entry, leaving a newer one alone.
    fn release(&self) {
        let mut subscriptions = lock_map(&self.subscriptions);
        if subscriptions
            .get(&self.room_id)
            .is_some_and(|s| s.id == self.subscription_id)
        {
            subscriptions.remove(&self.room_id);
        }
    }
}

/// Why a listener stopped reading its current stream.
enum StreamEnd {
    Cancelled,
    HubGone,
    Lost,
}

#[instrument(skip_all, name = "collab.bridge.listener", fields(room_id = %ctx.room_id))]
async fn run_listener<M: PubSubMedium>(ctx: ListenerContext<M>) {
    let mut backoff = RESUBSCRIBE_INITIAL_BACKOFF;

    loop {
        let subscribed = tokio::select! {
            () = ctx.cancel_token.cancelled() => break,
            result = ctx.medium.subscribe(&ctx.channel) => result,
        };

        match subscribed {
            Ok(stream) => {
                backoff = RESUBSCRIBE_INITIAL_BACKOFF;
                match forward(&ctx, stream).await {
                    StreamEnd::Cancelled => break,
                    StreamEnd::HubGone => {
                        debug!(target: "collab.bridge", room_id = %ctx.room_id, "Hub gone, listener exiting");
                        break;
                    }
                    StreamEnd::Lost => {
                        warn!(
                            target: "collab.bridge",
                            room_id = %ctx.room_id,
                            retry_in = ?backoff,
                            "Subscription stream ended, re-subscribing"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    target: "collab.bridge",
                    room_id = %ctx.room_id,
                    error = %e,
                    retry_in = ?backoff,
                    "Subscription failed, room is local-only until it recovers"
                );
            }
        }

        tokio::select! {
            () = ctx.cancel_token.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
    }

    ctx.release();
}

async fn forward<M: PubSubMedium>(
    ctx: &ListenerContext<M>,
    mut stream: BoxStream<'static, Vec<u8>>,
) -> StreamEnd {
    loop {
        tokio::select! {
            () = ctx.cancel_token.cancelled() => return StreamEnd::Cancelled,
            item = stream.next() => {
                let Some(payload) = item else {
                    return StreamEnd::Lost;
                };
                let Some(message) = decode_foreign(ctx, &payload) else {
                    continue;
                };
                if ctx.sink.send(message).await.is_err() {
                    return StreamEnd::HubGone;
                }
            }
        }
    }
}

/// Decode a medium payload; `None` for own frames and garbage.
fn decode_foreign<M: PubSubMedium>(ctx: &ListenerContext<M>, payload: &[u8]) -> Option<ForeignMessage> {
    let wrapped: BridgeFrame = match serde_json::from_slice(payload) {
        Ok(wrapped) => wrapped,
        Err(e) => {
            warn!(target: "collab.bridge", room_id = %ctx.room_id, error = %e, "Malformed bridge frame");
            return None;
        }
    };
    if wrapped.origin == ctx.instance_id {
        return None;
    }

    metrics::record_bridge_message_received();
    Some(ForeignMessage {
        room_id: ctx.room_id,
        sender: wrapped.sender,
        frame: Bytes::from(wrapped.frame.into_bytes()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Medium that never delivers and counts calls.
    #[derive(Default)]
    struct CountingMedium {
        subscribes: AtomicUsize,
        publishes: AtomicUsize,
    }

    #[async_trait]
    impl PubSubMedium for CountingMedium {
        async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<(), CollabError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            Err(CollabError::Redis("connection refused".to_string()))
        }

        async fn subscribe(&self, _channel: &str) -> Result<BoxStream<'static, Vec<u8>>, CollabError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(futures::stream::pending().boxed())
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_subscribe_twice_opens_one_subscription() {
        let medium = Arc::new(CountingMedium::default());
        let bridge = PubSubBridge::new(Arc::clone(&medium), "i-1", DEFAULT_CHANNEL_PREFIX);
        let (sink, _rx) = mpsc::channel(8);
        let room = Uuid::new_v4();

        bridge.subscribe(room, sink.clone());
        bridge.subscribe(room, sink);
        settle().await;

        assert_eq!(bridge.subscription_count(), 1);
        assert_eq!(medium.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_safe_when_not_subscribed() {
        let medium = Arc::new(CountingMedium::default());
        let bridge = PubSubBridge::new(medium, "i-1", DEFAULT_CHANNEL_PREFIX);
        let room = Uuid::new_v4();

        bridge.unsubscribe(room);
        let (sink, _rx) = mpsc::channel(8);
        bridge.subscribe(room, sink);
        bridge.unsubscribe(room);
        bridge.unsubscribe(room);

        assert!(!bridge.is_subscribed(room));
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let medium = Arc::new(CountingMedium::default());
        let bridge = PubSubBridge::new(Arc::clone(&medium), "i-1", DEFAULT_CHANNEL_PREFIX);

        bridge.publish(Uuid::new_v4(), None, Bytes::from_static(b"{\"type\":\"ping\"}"));
        settle().await;

        assert_eq!(medium.publishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_clears_subscriptions() {
        let medium = Arc::new(CountingMedium::default());
        let bridge = PubSubBridge::new(medium, "i-1", "test:");
        let (sink, _rx) = mpsc::channel(8);

        bridge.subscribe(Uuid::new_v4(), sink.clone());
        bridge.subscribe(Uuid::new_v4(), sink.clone());
        assert_eq!(bridge.subscription_count(), 2);

        bridge.shutdown();
        assert_eq!(bridge.subscription_count(), 0);

        bridge.subscribe(Uuid::new_v4(), sink);
        assert_eq!(bridge.subscription_count(), 0);
    }

    /// Medium whose first `failures` subscribes fail; later ones deliver
    /// whatever is queued in `frames`, then stay open.
    #[derive(Default)]
    struct FlakyMedium {
        failures: usize,
        subscribes: AtomicUsize,
        frames: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl PubSubMedium for FlakyMedium {
        async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<(), CollabError> {
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> Result<BoxStream<'static, Vec<u8>>, CollabError> {
            let attempt = self.subscribes.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(CollabError::Redis("connection refused".to_string()));
            }
            Ok(futures::stream::iter(self.frames.clone())
                .chain(futures::stream::pending())
                .boxed())
        }
    }

    fn foreign_frame(origin: &str) -> Vec<u8> {
        serde_json::to_vec(&BridgeFrame {
            origin: origin.to_string(),
            sender: None,
            frame: "{\"type\":\"table_created\"}".to_string(),
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscription_is_retried() {
        let medium = Arc::new(FlakyMedium {
            failures: 2,
            frames: vec![foreign_frame("i-2")],
            ..FlakyMedium::default()
        });
        let bridge = PubSubBridge::new(Arc::clone(&medium), "i-1", DEFAULT_CHANNEL_PREFIX);
        let (sink, mut rx) = mpsc::channel(8);
        let room = Uuid::new_v4();

        bridge.subscribe(room, sink);

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("listener should recover")
            .unwrap();
        assert_eq!(message.room_id, room);
        assert_eq!(medium.subscribes.load(Ordering::SeqCst), 3);
        assert!(bridge.is_subscribed(room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_retrying() {
        let medium = Arc::new(FlakyMedium {
            failures: usize::MAX,
            ..FlakyMedium::default()
        });
        let bridge = PubSubBridge::new(Arc::clone(&medium), "i-1", DEFAULT_CHANNEL_PREFIX);
        let (sink, _rx) = mpsc::channel(8);
        let room = Uuid::new_v4();

        bridge.subscribe(room, sink);
        tokio::time::sleep(Duration::from_secs(1)).await;
        bridge.unsubscribe(room);
        settle().await;
        let attempts = medium.subscribes.load(Ordering::SeqCst);
        assert!(attempts > 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(medium.subscribes.load(Ordering::SeqCst), attempts);
    }

    #[tokio::test]
    async fn test_listener_releases_room_when_hub_is_gone() {
        let medium = Arc::new(FlakyMedium {
            frames: vec![foreign_frame("i-2")],
            ..FlakyMedium::default()
        });
        let bridge = PubSubBridge::new(medium, "i-1", DEFAULT_CHANNEL_PREFIX);
        let (sink, rx) = mpsc::channel(8);
        let room = Uuid::new_v4();
        drop(rx);

        bridge.subscribe(room, sink);
        settle().await;

        assert!(!bridge.is_subscribed(room));
        let (sink, _rx) = mpsc::channel(8);
        bridge.subscribe(room, sink);
        assert!(bridge.is_subscribed(room));
    }

    #[tokio::test]
    async fn test_channel_naming() {
        let bridge = PubSubBridge::new(Arc::new(CountingMedium::default()), "i-1", "collab:room:");
        assert_eq!(
            bridge.channel_for(Uuid::nil()),
            "collab:room:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(bridge.instance_id(), "i-1");
    }
}
