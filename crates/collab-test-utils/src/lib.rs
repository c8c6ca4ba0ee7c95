//! # Collab Test Utilities
//!
//! Shared test utilities for the collaboration service.
//!
//! This crate provides fakes and fixtures for exercising the hub and the
//! bridge without a Redis server or a browser.
//!
//! ## Modules
//!
//! - `memory_medium` - In-process pub/sub medium shared by several hubs
//! - `client` - Hub-side test client wrapping a connection's outbound queue
//! - `fixtures` - Participants, tokens and hub setup helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use collab_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let hub = spawn_hub();
//!     let room = Uuid::new_v4();
//!
//!     let mut alice = TestClient::join(&hub, room, participant("alice")).await;
//!     let snapshot = alice.expect_kind(MessageType::PresenceSnapshot).await;
//! }
//! ```

pub mod client;
pub mod fixtures;
pub mod memory_medium;

// Re-export commonly used items
pub use client::*;
pub use fixtures::*;
pub use memory_medium::*;
