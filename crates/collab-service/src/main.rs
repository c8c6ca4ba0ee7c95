//! Collaboration Service
//!
//! Real-time room fan-out for Schema Studio projects.
//!
//! # Startup
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Initialize Prometheus metrics recorder
//! 4. Connect the pub/sub bridge (optional; single-instance without it)
//! 5. Spawn the hub actor
//! 6. Bind and serve HTTP (WebSocket, health, metrics)
//!
//! # Shutdown
//!
//! On SIGTERM or Ctrl+C the service drains the hub (readiness drops and every
//! socket receives a 1001 close) and stops the HTTP server.

#![warn(clippy::pedantic)]

use collab_service::bridge::{Bridge, NoopBridge, PubSubBridge, RedisMedium};
use collab_service::config::Config;
use collab_service::hub::HubHandle;
use collab_service::observability::{init_metrics_recorder, HealthState};
use collab_service::routes::build_routes;
use collab_service::transport::{JwtAuthorizer, TransportState};

use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for the hub task after shutdown.
const HUB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Collaboration Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        instance_id = %config.instance_id,
        bridge_configured = config.redis_url.is_some(),
        heartbeat_interval_seconds = config.heartbeat_interval_seconds,
        stale_after_seconds = config.stale_after_seconds,
        max_frame_bytes = config.max_frame_bytes,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let bridge = connect_bridge(&config).await;

    let (hub, hub_task) = HubHandle::spawn(config.hub_config(), Arc::clone(&bridge));
    info!("Hub started");

    // Readiness follows the hub: it drops as soon as the hub drains
    let health_state = Arc::new(HealthState::new(hub.clone()));

    let transport = TransportState {
        hub: hub.clone(),
        authorizer: Arc::new(JwtAuthorizer::new(&config.jwt_secret)),
        settings: config.transport_settings(),
    };
    let app = build_routes(transport, Arc::clone(&health_state), Some(prometheus_handle));

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    // Bind listener BEFORE serving to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind HTTP server");
        format!("Failed to bind HTTP server to {addr}: {e}")
    })?;
    info!(addr = %addr, "HTTP server bound successfully");

    health_state.set_listening();
    info!("Collaboration Service running - press Ctrl+C to shutdown");

    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown...");

            // Drains the hub, which also flips /ready to 503, and closes
            // every socket so the server can finish its connections
            if let Err(e) = shutdown_hub.shutdown().await {
                warn!(error = %e, "Hub shutdown error");
            }
        })
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e
        })?;

    hub.cancel();
    if tokio::time::timeout(HUB_SHUTDOWN_TIMEOUT, hub_task).await.is_err() {
        warn!("Hub task did not stop in time");
    }

    info!("Collaboration Service shutdown complete");
    Ok(())
}

/// Build the cross-instance bridge, falling back to single-instance mode
/// when Redis is not configured or unreachable.
async fn connect_bridge(config: &Config) -> Arc<dyn Bridge> {
    let Some(redis_url) = &config.redis_url else {
        info!("REDIS_URL not set, running single-instance");
        return Arc::new(NoopBridge);
    };

    match RedisMedium::connect(redis_url.expose_secret()).await {
        Ok(medium) => {
            info!(instance_id = %config.instance_id, "Pub/sub bridge connected");
            Arc::new(PubSubBridge::new(
                Arc::new(medium),
                config.instance_id.clone(),
                config.bridge_channel_prefix.clone(),
            ))
        }
        Err(e) => {
            warn!(error = %e, "Pub/sub bridge unavailable, running single-instance");
            Arc::new(NoopBridge)
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
