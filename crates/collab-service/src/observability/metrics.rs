//! Prometheus metric helpers.
//!
//! Naming follows Prometheus conventions: `collab_` prefix, `_total` suffix
//! for counters and `_seconds` for duration histograms.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Fan-out runs in-process; anything past a few ms is a stall.
        .set_buckets_for_metric(
            Matcher::Full("collab_fanout_seconds".to_string()),
            &[
                0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.002_5, 0.005, 0.010, 0.025, 0.050,
            ],
        )
        .map_err(|e| format!("Failed to set fan-out buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `collab_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("collab_connections_active").set(count as f64);
}

/// Metric: `collab_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("collab_rooms_active").set(count as f64);
}

// ============================================================================
// Fan-out
// ============================================================================

/// Record one fan-out.
///
/// Metric: `collab_messages_broadcast_total`, `collab_fanout_seconds`
/// Labels: `origin` (local, bridge)
pub fn record_broadcast(origin: &'static str, duration: Duration) {
    counter!("collab_messages_broadcast_total", "origin" => origin).increment(1);
    histogram!("collab_fanout_seconds").record(duration.as_secs_f64());
}

/// Record a frame that was not delivered to a room member.
///
/// Metric: `collab_messages_dropped_total`
/// Labels: `reason` (queue_full, closed)
pub fn record_message_dropped(reason: &'static str) {
    counter!("collab_messages_dropped_total", "reason" => reason).increment(1);
}

/// Record an inbound frame refused before reaching the hub.
///
/// Metric: `collab_frames_rejected_total`
/// Labels: `reason` (rate_limited, too_large, malformed, forbidden_type)
pub fn record_frame_rejected(reason: &'static str) {
    counter!("collab_frames_rejected_total", "reason" => reason).increment(1);
}

// ============================================================================
// Bridge
// ============================================================================

/// Metric: `collab_bridge_publish_failures_total`
pub fn record_bridge_publish_failure() {
    counter!("collab_bridge_publish_failures_total").increment(1);
}

/// Metric: `collab_bridge_messages_received_total`
pub fn record_bridge_message_received() {
    counter!("collab_bridge_messages_received_total").increment(1);
}
