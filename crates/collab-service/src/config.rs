//! Collaboration service configuration.
//!
//! Configuration is loaded from environment variables. Sensitive fields are
//! redacted in Debug output.

use crate::bridge::pubsub::DEFAULT_CHANNEL_PREFIX;
use crate::hub::{HubConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_STALE_AFTER};
use crate::rate_limit::{DEFAULT_RATE_LIMIT_CAPACITY, DEFAULT_RATE_LIMIT_REFILL};
use crate::transport::ws::{self, DEFAULT_MAX_FRAME_BYTES, DEFAULT_OUTBOUND_QUEUE_CAPACITY};
use crate::transport::TransportSettings;

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default heartbeat sweep interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = DEFAULT_HEARTBEAT_INTERVAL.as_secs();

/// Default staleness threshold in seconds.
pub const DEFAULT_STALE_AFTER_SECONDS: u64 = DEFAULT_STALE_AFTER.as_secs();

/// Default per-frame write deadline in seconds.
pub const DEFAULT_WRITE_TIMEOUT_SECONDS: u64 = ws::DEFAULT_WRITE_TIMEOUT.as_secs();

/// Default read deadline in seconds.
pub const DEFAULT_READ_TIMEOUT_SECONDS: u64 = ws::DEFAULT_READ_TIMEOUT.as_secs();

/// Default in-band auth deadline in seconds.
pub const DEFAULT_AUTH_TIMEOUT_SECONDS: u64 = ws::DEFAULT_AUTH_TIMEOUT.as_secs();

/// Default token refill interval in milliseconds.
pub const DEFAULT_RATE_LIMIT_REFILL_MS: u64 = DEFAULT_RATE_LIMIT_REFILL.as_millis() as u64;

/// Collaboration service configuration.
#[derive(Clone)]
pub struct Config {
    /// HS256 secret for access tokens.
    pub jwt_secret: SecretString,

    /// HTTP/WebSocket bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Redis URL; the bridge is enabled when set.
    pub redis_url: Option<SecretString>,

    /// Origin id stamped on bridge frames.
    pub instance_id: String,

    /// Pub/sub channel prefix (default: "collab:room:").
    pub bridge_channel_prefix: String,

    pub heartbeat_interval_seconds: u64,
    pub stale_after_seconds: u64,
    pub write_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub auth_timeout_seconds: u64,
    pub outbound_queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_ms: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("instance_id", &self.instance_id)
            .field("bridge_channel_prefix", &self.bridge_channel_prefix)
            .field("heartbeat_interval_seconds", &self.heartbeat_interval_seconds)
            .field("stale_after_seconds", &self.stale_after_seconds)
            .field("write_timeout_seconds", &self.write_timeout_seconds)
            .field("read_timeout_seconds", &self.read_timeout_seconds)
            .field("auth_timeout_seconds", &self.auth_timeout_seconds)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("rate_limit_capacity", &self.rate_limit_capacity)
            .field("rate_limit_refill_ms", &self.rate_limit_refill_ms)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = vars
            .get("COLLAB_JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("COLLAB_JWT_SECRET".to_string()))?;
        let jwt_secret = SecretString::from(jwt_secret.clone());

        let bind_address = vars
            .get("COLLAB_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let instance_id = vars
            .get("COLLAB_INSTANCE_ID")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| {
                let host = vars.get("HOSTNAME").map_or("local", String::as_str);
                let suffix = Uuid::new_v4().simple().to_string();
                format!("collab-{host}-{}", suffix.get(..8).unwrap_or(&suffix))
            });

        let bridge_channel_prefix = vars
            .get("COLLAB_BRIDGE_CHANNEL_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIX.to_string());

        let config = Self {
            jwt_secret,
            bind_address,
            redis_url,
            instance_id,
            bridge_channel_prefix,
            heartbeat_interval_seconds: positive(
                vars,
                "COLLAB_HEARTBEAT_INTERVAL_SECONDS",
                DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            )?,
            stale_after_seconds: positive(
                vars,
                "COLLAB_STALE_AFTER_SECONDS",
                DEFAULT_STALE_AFTER_SECONDS,
            )?,
            write_timeout_seconds: positive(
                vars,
                "COLLAB_WRITE_TIMEOUT_SECONDS",
                DEFAULT_WRITE_TIMEOUT_SECONDS,
            )?,
            read_timeout_seconds: positive(
                vars,
                "COLLAB_READ_TIMEOUT_SECONDS",
                DEFAULT_READ_TIMEOUT_SECONDS,
            )?,
            auth_timeout_seconds: positive(
                vars,
                "COLLAB_AUTH_TIMEOUT_SECONDS",
                DEFAULT_AUTH_TIMEOUT_SECONDS,
            )?,
            outbound_queue_capacity: positive(
                vars,
                "COLLAB_OUTBOUND_QUEUE_CAPACITY",
                DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            )?,
            max_frame_bytes: positive(vars, "COLLAB_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?,
            rate_limit_capacity: positive(
                vars,
                "COLLAB_RATE_LIMIT_CAPACITY",
                DEFAULT_RATE_LIMIT_CAPACITY,
            )?,
            rate_limit_refill_ms: positive(
                vars,
                "COLLAB_RATE_LIMIT_REFILL_MS",
                DEFAULT_RATE_LIMIT_REFILL_MS,
            )?,
        };

        if config.stale_after_seconds <= config.heartbeat_interval_seconds {
            return Err(ConfigError::InvalidValue(format!(
                "COLLAB_STALE_AFTER_SECONDS ({}) must exceed COLLAB_HEARTBEAT_INTERVAL_SECONDS ({})",
                config.stale_after_seconds, config.heartbeat_interval_seconds
            )));
        }

        Ok(config)
    }

    /// Hub timing derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            stale_after: Duration::from_secs(self.stale_after_seconds),
        }
    }

    /// Transport limits derived from this configuration.
    #[must_use]
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            write_timeout: Duration::from_secs(self.write_timeout_seconds),
            read_timeout: Duration::from_secs(self.read_timeout_seconds),
            auth_timeout: Duration::from_secs(self.auth_timeout_seconds),
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_frame_bytes: self.max_frame_bytes,
            rate_limit_capacity: self.rate_limit_capacity,
            rate_limit_refill: Duration::from_millis(self.rate_limit_refill_ms),
        }
    }
}

/// Parse a strictly positive number, falling back to `default` when unset.
fn positive<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidValue(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
    }
}
