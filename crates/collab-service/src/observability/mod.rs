//! Observability for the collaboration service.
//!
//! # Privacy by Default
//!
//! Loops are instrumented with `#[instrument(skip_all)]` and explicit fields.
//! Tokens, display names and payload contents never appear in spans, logs or
//! metric labels. Labels are bounded:
//! - `origin`: 2 values (local, bridge)
//! - `reason`: bounded by [`crate::hub::CloseReason`] and admission failures
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `collab_connections_active` | Gauge | none | Registered connections |
//! | `collab_rooms_active` | Gauge | none | Non-empty rooms |
//! | `collab_messages_broadcast_total` | Counter | `origin` | Fan-outs performed |
//! | `collab_messages_dropped_total` | Counter | `reason` | Frames not delivered to a member |
//! | `collab_frames_rejected_total` | Counter | `reason` | Inbound frames refused by admission control |
//! | `collab_bridge_publish_failures_total` | Counter | none | Pub/sub publish errors |
//! | `collab_bridge_messages_received_total` | Counter | none | Foreign frames accepted |
//! | `collab_fanout_seconds` | Histogram | none | Time to fan one message out locally |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
