//! Pre-configured test data fixtures.
//!
//! Provides:
//! - Participants with deterministic colors
//! - Signed access tokens
//! - Hub setup in single-instance and bridged mode

use collab_service::bridge::{Bridge, NoopBridge, PubSubBridge};
use collab_service::hub::{HubConfig, HubHandle, Participant};
use collab_service::transport::{color_for, Claims};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use std::sync::Arc;
use uuid::Uuid;

use crate::memory_medium::InMemoryMedium;

/// Secret shared by [`mint_token`] and authorizers built in tests.
pub const TEST_JWT_SECRET: &str = "collab-test-secret-at-least-32-bytes!";

/// Channel prefix used by bridged test hubs.
pub const TEST_CHANNEL_PREFIX: &str = "test:room:";

/// A participant with a random user id.
#[must_use]
pub fn participant(name: &str) -> Participant {
    let user_id = Uuid::new_v4();
    Participant {
        user_id,
        display_name: name.to_string(),
        color: color_for(user_id),
    }
}

/// Sign an HS256 token with [`TEST_JWT_SECRET`].
#[must_use]
pub fn mint_token(user_id: Uuid, name: &str, projects: Option<Vec<Uuid>>) -> String {
    let claims = Claims {
        sub: user_id,
        name: Some(name.to_string()),
        exp: chrono::Utc::now().timestamp() + 3600,
        projects,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .expect("token signing failed")
}

/// Single-instance hub with default timing.
#[must_use]
pub fn spawn_hub() -> HubHandle {
    spawn_hub_with(HubConfig::default(), Arc::new(NoopBridge))
}

/// Hub with explicit timing and bridge.
#[must_use]
pub fn spawn_hub_with(config: HubConfig, bridge: Arc<dyn Bridge>) -> HubHandle {
    let (hub, _task) = HubHandle::spawn(config, bridge);
    hub
}

/// Hub instance bridged through `medium`.
///
/// Returns the bridge too so tests can inspect its subscriptions.
#[must_use]
pub fn spawn_bridged_hub(
    medium: &Arc<InMemoryMedium>,
    instance_id: &str,
) -> (HubHandle, Arc<PubSubBridge<InMemoryMedium>>) {
    let bridge = Arc::new(PubSubBridge::new(
        Arc::clone(medium),
        instance_id,
        TEST_CHANNEL_PREFIX,
    ));
    let hub = spawn_hub_with(HubConfig::default(), Arc::clone(&bridge) as Arc<dyn Bridge>);
    (hub, bridge)
}

/// Channel name a bridged test hub uses for `room_id`.
#[must_use]
pub fn test_channel(room_id: Uuid) -> String {
    format!("{TEST_CHANNEL_PREFIX}{room_id}")
}
