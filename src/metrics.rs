//! Prometheus metrics for driver activity
//!
//! Statics are created lazily and registered into [`DRIVER_REGISTRY`] by
//! [`init_metrics`]; applications can gather that registry or call
//! [`export_metrics`] for the text exposition format.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Registry holding every driver metric
    pub static ref DRIVER_REGISTRY: Registry = Registry::new();

    pub static ref QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("photondb_driver_queries_total", "Query envelopes written, by kind"),
        &["kind"]
    ).unwrap();

    pub static ref RECONNECT_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("photondb_driver_reconnect_attempts_total", "Connection attempts by outcome"),
        &["server", "outcome"]
    ).unwrap();

    pub static ref OPEN_CONNECTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("photondb_driver_open_connections", "Open pooled connections per server"),
        &["server"]
    ).unwrap();

    pub static ref HANDSHAKE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "photondb_driver_handshake_duration_seconds",
            "Transport connect plus SCRAM handshake time"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
    ).unwrap();
}

/// Register the driver metrics. Safe to call more than once.
pub fn init_metrics() {
    info!("Initializing driver metrics");
    DRIVER_REGISTRY.register(Box::new(QUERIES_TOTAL.clone())).ok();
    DRIVER_REGISTRY.register(Box::new(RECONNECT_ATTEMPTS.clone())).ok();
    DRIVER_REGISTRY.register(Box::new(OPEN_CONNECTIONS.clone())).ok();
    DRIVER_REGISTRY.register(Box::new(HANDSHAKE_DURATION.clone())).ok();
}

/// Export all driver metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = DRIVER_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
