//! In-memory pub/sub medium for bridge testing.
//!
//! Channels are tokio broadcast channels created on first use. Several
//! [`collab_service::bridge::PubSubBridge`]s sharing one `InMemoryMedium`
//! behave like hub instances sharing one Redis.
//!
//! # Example
//!
//! ```rust,ignore
//! let medium = Arc::new(InMemoryMedium::new());
//! let bridge_a = PubSubBridge::new(Arc::clone(&medium), "a", "test:");
//! let bridge_b = PubSubBridge::new(Arc::clone(&medium), "b", "test:");
//! ```

use async_trait::async_trait;
use collab_service::bridge::PubSubMedium;
use collab_service::errors::CollabError;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Per-channel buffer.
const CHANNEL_CAPACITY: usize = 256;

/// In-process [`PubSubMedium`].
#[derive(Debug)]
pub struct InMemoryMedium {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    published: AtomicUsize,
    failing: AtomicBool,
}

impl Default for InMemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMedium {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            published: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// A medium on which every publish and subscribe fails.
    #[must_use]
    pub fn failing() -> Self {
        let medium = Self::new();
        medium.set_failing(true);
        medium
    }

    /// Toggle failure mode.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Drop `channel`, ending every open subscription stream on it.
    pub fn disconnect(&self, channel: &str) {
        self.channels.lock().unwrap().remove(channel);
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of successful publishes, across all channels.
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Poll until `channel` has exactly `expected` subscribers.
    ///
    /// # Panics
    ///
    /// Panics if the count is not reached within one second.
    pub async fn wait_for_subscribers(&self, channel: &str, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while self.subscriber_count(channel) != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "channel {channel} has {} subscribers, expected {expected}",
                self.subscriber_count(channel)
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSubMedium for InMemoryMedium {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CollabError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollabError::Bridge("in-memory medium is failing".to_string()));
        }
        // No receivers is not an error, same as Redis PUBLISH.
        let _ = self.sender(channel).send(payload);
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, CollabError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollabError::Bridge("in-memory medium is failing".to_string()));
        }
        let receiver = self.sender(channel).subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(|item| async move { item.ok() })
            .boxed())
    }
}
