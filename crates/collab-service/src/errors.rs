//! Collaboration service error types.
//!
//! Errors fall into the classes the hub distinguishes at runtime:
//! - admission errors (`RateLimited`, `FrameTooLarge`, `Decode`) drop a frame,
//! - connection-fatal errors map to a [`CloseReason`] sent to the peer,
//! - bridge errors are logged and swallowed by the caller,
//! - lifecycle errors (`Draining`) are plain rejections.
//!
//! Internal details are logged server-side but not exposed to clients.

use crate::hub::CloseReason;
use thiserror::Error;

/// Collaboration service error type.
#[derive(Debug, Error)]
pub enum CollabError {
    /// Hub is draining or shut down; new registrations are rejected.
    #[error("Hub is draining")]
    Draining,

    /// Envelope or payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Inbound frame exceeded the configured size bound.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Connection exceeded its inbound rate limit.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Token missing, malformed, or expired.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated user may not access the requested project.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Pub/sub bridge failure.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Internal error (channel closed, task failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CollabError {
    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            CollabError::Draining => "Server is shutting down, please reconnect".to_string(),
            CollabError::Decode(_) => "Malformed message".to_string(),
            CollabError::FrameTooLarge { max, .. } => format!("Message exceeds {max} bytes"),
            CollabError::RateLimited => "Too many messages, slow down".to_string(),
            CollabError::Unauthorized(_) => "Invalid or expired token".to_string(),
            CollabError::Forbidden(_) => "Access to this project is denied".to_string(),
            CollabError::Bridge(_) | CollabError::Redis(_) | CollabError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Returns true for errors that only reject a single frame.
    #[must_use]
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            CollabError::RateLimited | CollabError::FrameTooLarge { .. } | CollabError::Decode(_)
        )
    }

    /// Low-cardinality label for metrics.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            CollabError::Draining => "draining",
            CollabError::Decode(_) => "malformed",
            CollabError::FrameTooLarge { .. } => "too_large",
            CollabError::RateLimited => "rate_limited",
            CollabError::Unauthorized(_) => "unauthorized",
            CollabError::Forbidden(_) => "forbidden",
            CollabError::Bridge(_) => "bridge",
            CollabError::Redis(_) => "redis",
            CollabError::Internal(_) => "internal",
        }
    }

    /// Close reason to send when this error terminates a connection.
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        match self {
            CollabError::Draining => CloseReason::ServerShutdown,
            CollabError::Unauthorized(_) => CloseReason::Unauthorized,
            CollabError::Forbidden(_) => CloseReason::Forbidden,
            CollabError::Decode(_)
            | CollabError::FrameTooLarge { .. }
            | CollabError::RateLimited => CloseReason::ProtocolError,
            CollabError::Bridge(_) | CollabError::Redis(_) | CollabError::Internal(_) => {
                CloseReason::InternalError
            }
        }
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Decode(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_errors() {
        assert!(CollabError::RateLimited.is_admission_error());
        assert!(CollabError::FrameTooLarge { size: 10, max: 5 }.is_admission_error());
        assert!(CollabError::Decode("bad".to_string()).is_admission_error());
        assert!(!CollabError::Draining.is_admission_error());
        assert!(!CollabError::Unauthorized("expired".to_string()).is_admission_error());
    }

    #[test]
    fn test_rejection_labels() {
        assert_eq!(CollabError::RateLimited.metric_label(), "rate_limited");
        assert_eq!(
            CollabError::FrameTooLarge { size: 10, max: 5 }.metric_label(),
            "too_large"
        );
        assert_eq!(CollabError::Decode("bad".to_string()).metric_label(), "malformed");
    }

    #[test]
    fn test_close_reason_mapping() {
        assert_eq!(
            CollabError::Unauthorized("x".to_string()).close_reason(),
            CloseReason::Unauthorized
        );
        assert_eq!(
            CollabError::Forbidden("x".to_string()).close_reason(),
            CloseReason::Forbidden
        );
        assert_eq!(
            CollabError::Draining.close_reason(),
            CloseReason::ServerShutdown
        );
        assert_eq!(
            CollabError::Decode("x".to_string()).close_reason(),
            CloseReason::ProtocolError
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let redis_err = CollabError::Redis("connection refused at 10.0.0.7:6379".to_string());
        assert!(!redis_err.client_message().contains("10.0.0.7"));
        assert_eq!(redis_err.client_message(), "An internal error occurred");

        let auth_err = CollabError::Unauthorized("signature mismatch for kid abc".to_string());
        assert!(!auth_err.client_message().contains("kid"));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", CollabError::FrameTooLarge { size: 70_000, max: 65_536 }),
            "Frame too large: 70000 bytes (max 65536)"
        );
        assert_eq!(
            format!("{}", CollabError::Bridge("publish timed out".to_string())),
            "Bridge error: publish timed out"
        );
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let collab: CollabError = err.into();
        assert!(matches!(collab, CollabError::Decode(_)));
    }
}
