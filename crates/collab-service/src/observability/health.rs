//! Health endpoints.
//!
//! - `GET /health` - liveness: the hub actor is still running
//! - `GET /ready` - readiness: the listener is bound and the hub accepts
//!   registrations
//!
//! Both are read straight from the hub, so readiness drops the moment the
//! hub starts draining, whoever triggered the shutdown.

use crate::hub::HubHandle;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Probe state backed by the hub's lifecycle.
#[derive(Debug)]
pub struct HealthState {
    hub: HubHandle,
    listening: AtomicBool,
}

impl HealthState {
    #[must_use]
    pub fn new(hub: HubHandle) -> Self {
        Self {
            hub,
            listening: AtomicBool::new(false),
        }
    }

    /// Called once the HTTP listener is bound.
    pub fn set_listening(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.hub.is_running()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && !self.hub.is_draining()
    }
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if !state.listening.load(Ordering::SeqCst) {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    } else if state.hub.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else {
        (StatusCode::OK, "ready")
    }
}
