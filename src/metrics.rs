//! Prometheus Metrics for the Voice Gateway
//!
//! Provides observability metrics for monitoring the gateway.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Gateway metrics.
#[derive(Clone)]
pub struct GatewayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total device connections registered.
    pub connections_total: IntCounter,
    /// Current registered device connections.
    pub connections_active: IntGauge,

    // Session metrics
    /// Total upstream sessions opened.
    pub sessions_opened: IntCounter,
    /// Total upstream sessions closed.
    pub sessions_closed: IntCounter,
    /// Upstream handshake failures.
    pub upstream_failures: IntCounter,

    // UDP metrics
    /// Audio datagrams accepted and forwarded upstream.
    pub udp_received: IntCounter,
    /// Audio datagrams sent to devices.
    pub udp_sent: IntCounter,
    /// Datagrams dropped (malformed, unknown MAC, cookie or sequence).
    pub udp_dropped: IntCounter,
}

impl GatewayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "gateway_connections_total",
            "Total device connections registered",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "gateway_connections_active",
            "Current registered device connections",
        ))
        .unwrap();

        let sessions_opened = IntCounter::with_opts(Opts::new(
            "gateway_sessions_opened_total",
            "Total upstream sessions opened",
        ))
        .unwrap();

        let sessions_closed = IntCounter::with_opts(Opts::new(
            "gateway_sessions_closed_total",
            "Total upstream sessions closed",
        ))
        .unwrap();

        let upstream_failures = IntCounter::with_opts(Opts::new(
            "gateway_upstream_failures_total",
            "Total upstream handshake failures",
        ))
        .unwrap();

        let udp_received = IntCounter::with_opts(Opts::new(
            "gateway_udp_received_total",
            "Audio datagrams accepted and forwarded upstream",
        ))
        .unwrap();

        let udp_sent = IntCounter::with_opts(Opts::new(
            "gateway_udp_sent_total",
            "Audio datagrams sent to devices",
        ))
        .unwrap();

        let udp_dropped = IntCounter::with_opts(Opts::new(
            "gateway_udp_dropped_total",
            "Datagrams dropped before reaching a session",
        ))
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_opened.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(upstream_failures.clone()))
            .unwrap();
        registry.register(Box::new(udp_received.clone())).unwrap();
        registry.register(Box::new(udp_sent.clone())).unwrap();
        registry.register(Box::new(udp_dropped.clone())).unwrap();

        GatewayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            sessions_opened,
            sessions_closed,
            upstream_failures,
            udp_received,
            udp_sent,
            udp_dropped,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
