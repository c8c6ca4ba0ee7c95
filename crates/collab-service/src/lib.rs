//! Collaboration Service Library
//!
//! Real-time collaboration hub for Schema Studio, the multi-user database
//! schema designer. Every project is a room; the hub keeps track of who is
//! in each room and fans edits, cursor moves and presence changes out to
//! everyone else in it.
//!
//! # Architecture
//!
//! ```text
//! WebSocket ──► transport::ws (reader) ──► HubHandle ──► HubActor (singleton)
//!                      ▲                                   ├── rooms: project id → members
//!                      │                                   ├── heartbeat sweep
//!        transport::ws (writer) ◄── per-connection queue ◄─┤
//!                                                          └── Bridge ◄──► Redis pub/sub
//! ```
//!
//! # Key Design Decisions
//!
//! - **One owner for room state**: all room mutation happens on the hub loop
//! - **Non-blocking fan-out**: a full outbound queue evicts that member only
//! - **Hub-initiated close**: the hub records a close reason; the writer sends it
//! - **Optional bridge**: without `REDIS_URL` the hub runs single-instance
//!
//! # Modules
//!
//! - [`hub`] - Room registry, presence and fan-out actor
//! - [`bridge`] - Cross-instance pub/sub relay
//! - [`transport`] - WebSocket upgrade, authentication, admission control
//! - [`protocol`] - Wire envelope and payloads
//! - [`rate_limit`] - Token-bucket limiter
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types
//! - [`observability`] - Metrics and health endpoints
//! - [`routes`] - HTTP router

pub mod bridge;
pub mod config;
pub mod errors;
pub mod hub;
pub mod observability;
pub mod protocol;
pub mod rate_limit;
pub mod routes;
pub mod transport;
