//! Prometheus metrics
//!
//! Exposed by the management API under /metrics.

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total connections handled by the tunnel
    pub static ref TUNNEL_CONNECTIONS_TOTAL: IntCounter = IntCounter::new(
        "strait_tunnel_connections_total",
        "Total number of connections handled by the tunnel"
    ).unwrap();

    /// Currently active connections
    pub static ref TUNNEL_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "strait_tunnel_connections_active",
        "Number of currently active connections"
    ).unwrap();

    /// Failed outbound dials
    pub static ref TUNNEL_DIAL_FAILED: IntCounter = IntCounter::new(
        "strait_tunnel_dial_failed_total",
        "Total number of failed outbound dials"
    ).unwrap();

    /// Total bytes uploaded (client to remote)
    pub static ref TRAFFIC_BYTES_UPLOADED: IntCounter = IntCounter::new(
        "strait_traffic_bytes_uploaded_total",
        "Total bytes uploaded"
    ).unwrap();

    /// Total bytes downloaded (remote to client)
    pub static ref TRAFFIC_BYTES_DOWNLOADED: IntCounter = IntCounter::new(
        "strait_traffic_bytes_downloaded_total",
        "Total bytes downloaded"
    ).unwrap();

    /// Bytes uploaded per outbound
    pub static ref OUTBOUND_BYTES_UPLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("strait_outbound_bytes_uploaded_total", "Bytes uploaded per outbound"),
        &["tag"]
    ).unwrap();

    /// Bytes downloaded per outbound
    pub static ref OUTBOUND_BYTES_DOWNLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("strait_outbound_bytes_downloaded_total", "Bytes downloaded per outbound"),
        &["tag"]
    ).unwrap();

    /// Connection duration histogram
    pub static ref CONNECTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "strait_connection_duration_seconds",
            "Connection duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["outbound"]
    ).unwrap();
}

/// Register all metrics with the global registry. Idempotent.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(TUNNEL_CONNECTIONS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(TUNNEL_CONNECTIONS_ACTIVE.clone()))
        .ok();
    REGISTRY.register(Box::new(TUNNEL_DIAL_FAILED.clone())).ok();
    REGISTRY
        .register(Box::new(TRAFFIC_BYTES_UPLOADED.clone()))
        .ok();
    REGISTRY
        .register(Box::new(TRAFFIC_BYTES_DOWNLOADED.clone()))
        .ok();
    REGISTRY
        .register(Box::new(OUTBOUND_BYTES_UPLOADED.clone()))
        .ok();
    REGISTRY
        .register(Box::new(OUTBOUND_BYTES_DOWNLOADED.clone()))
        .ok();
    REGISTRY
        .register(Box::new(CONNECTION_DURATION_SECONDS.clone()))
        .ok();
}

/// Format bytes to a human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500B");
        assert_eq!(format_bytes(1024), "1.00KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00MB");
    }
}
