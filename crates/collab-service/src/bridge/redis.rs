//! Redis pub/sub medium.
//!
//! Publishing shares one `MultiplexedConnection`, which is cheap to clone and
//! safe to use concurrently. Every subscription opens its own dedicated
//! pub/sub connection; dropping the returned stream closes it.

use super::pubsub::PubSubMedium;
use crate::errors::CollabError;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, error, instrument, warn};

/// Redis-backed [`PubSubMedium`].
#[derive(Clone)]
pub struct RedisMedium {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisMedium {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CollabError::Redis` if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, CollabError> {
        let client = Client::open(redis_url).map_err(|e| {
            // The URL may carry credentials; never log it.
            error!(target: "collab.bridge.redis", error = %e, "Failed to open Redis client");
            CollabError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "collab.bridge.redis", error = %e, "Failed to connect to Redis");
                CollabError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        debug!(target: "collab.bridge.redis", "Connected to Redis");
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl PubSubMedium for RedisMedium {
    #[instrument(skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CollabError> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| CollabError::Redis(format!("PUBLISH failed: {e}")))
    }

    #[instrument(skip_all, fields(channel = %channel))]
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, CollabError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CollabError::Redis(format!("Failed to open pub/sub connection: {e}")))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CollabError::Redis(format!("SUBSCRIBE failed: {e}")))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<Vec<u8>>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(target: "collab.bridge.redis", error = %e, "Unreadable pub/sub payload");
                        None
                    }
                }
            });

        Ok(stream.boxed())
    }
}
