//! Transport adapter: WebSocket upgrade, authentication, admission control.

pub mod auth;
pub mod ws;

pub use auth::{color_for, extract_token, Authorizer, Claims, JwtAuthorizer};
pub use ws::{ws_handler, TransportSettings, TransportState};
