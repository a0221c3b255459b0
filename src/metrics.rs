//! Stream health metrics
//!
//! Recorded through the `metrics` facade; nothing is exported unless a
//! recorder is installed (see [`init_metrics_exporter`]).
//!
//! # Metrics
//!
//! - `stream_events_total{type}`: decoded events by type
//! - `stream_events_dropped_total{reason}`: events discarded before or during reconciliation
//! - `stream_reconnects_total`: scheduled reconnect attempts
//! - `stream_health_probes_total{result}`: staleness probes by outcome
//! - `resync_total{outcome}`: completed resyncs by outcome
//! - `stream_connection_state`: current connection state as a numeric code
//!
//! # Examples
//!
//! ```
//! use openchamber_sync::metrics::record_event;
//!
//! record_event("message.updated");
//! ```

use metrics::{gauge, increment_counter};

use crate::supervisor::ConnectionState;

/// Count one decoded event
pub fn record_event(event_type: &str) {
    increment_counter!("stream_events_total", "type" => event_type.to_string());
}

/// Count one dropped event
pub fn record_dropped(reason: &'static str) {
    increment_counter!("stream_events_dropped_total", "reason" => reason);
}

/// Count one scheduled reconnect
pub fn record_reconnect(attempt: u32) {
    increment_counter!("stream_reconnects_total");
    tracing::trace!(attempt, "Recorded reconnect");
}

/// Count one liveness probe
pub fn record_health_probe(healthy: bool) {
    let result = if healthy { "healthy" } else { "unhealthy" };
    increment_counter!("stream_health_probes_total", "result" => result);
}

/// Count one resync by outcome label
pub fn record_resync(outcome: &'static str) {
    increment_counter!("resync_total", "outcome" => outcome);
}

/// Publish the current connection state
pub fn set_connection_state(state: ConnectionState) {
    gauge!("stream_connection_state", state.code() as f64);
}

/// Initialize metrics exporter
///
/// When the `prometheus` feature is enabled this installs a Prometheus
/// recorder with an HTTP listener on the default address. Without the
/// feature it does nothing.
///
/// # Examples
///
/// ```
/// use openchamber_sync::metrics::init_metrics_exporter;
///
/// init_metrics_exporter();
/// ```
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let builder = PrometheusBuilder::new();
        let _ = builder.install().map_err(|e| {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        });
    }
}
