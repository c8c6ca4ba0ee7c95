//! HTTP routes for the collaboration service.
//!
//! Defines the Axum router serving the WebSocket endpoint next to the
//! health and metrics endpoints.

use crate::observability::{health_router, HealthState};
use crate::transport::{ws_handler, TransportState};

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/ws/projects/:project_id` - WebSocket upgrade into a project room
/// - `/health`, `/ready` - liveness and readiness probes
/// - `/metrics` - Prometheus exposition, when a recorder is installed
/// - TraceLayer for request logging
pub fn build_routes(
    transport: TransportState,
    health_state: Arc<HealthState>,
    prometheus: Option<PrometheusHandle>,
) -> Router {
    let ws_routes = Router::new()
        .route("/ws/projects/:project_id", get(ws_handler))
        .with_state(transport);

    let mut app = ws_routes.merge(health_router(health_state));

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    app.layer(TraceLayer::new_for_http())
}
