//! Prometheus metrics for the supervised connection
//!
//! Covers connect attempts, failures by kind, reconnect outcomes,
//! suspensions, heartbeat latency and the current observed status.

use crate::core::{FailureKind, ObservedStatus};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;
use tracing::info;

/// Connection supervisor metrics
#[derive(Clone)]
pub struct ConnectionMetrics {
    registry: Arc<Registry>,
    /// Transport opens started (initial and reconnect)
    pub connect_attempts_total: IntCounter,
    /// Failures recorded, by kind
    pub failures_total: IntCounterVec,
    /// Reconnect attempts that ended with a validated session
    pub reconnect_success_total: IntCounter,
    /// Times the engine suspended attempts
    pub suspensions_total: IntCounter,
    /// Heartbeat round trip in milliseconds
    pub heartbeat_latency_ms: Histogram,
    /// Observed status (0=disconnected, 1=connecting, 2=connected, 3=recovering)
    pub status: IntGauge,
    /// Inbound frames routed to subscribers
    pub messages_received_total: IntCounter,
}

impl ConnectionMetrics {
    /// Create metrics on a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create metrics on an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let connect_attempts_total = IntCounter::with_opts(
            Opts::new("connect_attempts_total", "Total number of transport opens started")
                .namespace("keel"),
        )?;
        registry.register(Box::new(connect_attempts_total.clone()))?;

        let failures_total = IntCounterVec::new(
            Opts::new("failures_total", "Total connection failures recorded").namespace("keel"),
            &["kind"],
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        let reconnect_success_total = IntCounter::with_opts(
            Opts::new("reconnect_success_total", "Total successful reconnections")
                .namespace("keel"),
        )?;
        registry.register(Box::new(reconnect_success_total.clone()))?;

        let suspensions_total = IntCounter::with_opts(
            Opts::new("suspensions_total", "Times reconnect attempts were suspended")
                .namespace("keel"),
        )?;
        registry.register(Box::new(suspensions_total.clone()))?;

        let heartbeat_latency_ms = Histogram::with_opts(
            HistogramOpts::new("heartbeat_latency_ms", "Heartbeat round trip in milliseconds")
                .namespace("keel")
                .buckets(vec![10.0, 25.0, 50.0, 100.0, 150.0, 250.0, 500.0, 1000.0, 2500.0]),
        )?;
        registry.register(Box::new(heartbeat_latency_ms.clone()))?;

        let status = IntGauge::with_opts(
            Opts::new("connection_status", "Observed connection status").namespace("keel"),
        )?;
        registry.register(Box::new(status.clone()))?;

        let messages_received_total = IntCounter::with_opts(
            Opts::new("messages_received_total", "Inbound frames routed to subscribers")
                .namespace("keel"),
        )?;
        registry.register(Box::new(messages_received_total.clone()))?;

        info!("Connection metrics registered");

        Ok(Self {
            registry,
            connect_attempts_total,
            failures_total,
            reconnect_success_total,
            suspensions_total,
            heartbeat_latency_ms,
            status,
            messages_received_total,
        })
    }

    /// Get the underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.failures_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn set_status(&self, status: ObservedStatus) {
        self.status.set(status.as_gauge());
    }

    pub fn observe_latency(&self, latency_ms: i64) {
        if latency_ms >= 0 {
            self.heartbeat_latency_ms.observe(latency_ms as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let metrics = ConnectionMetrics::new().unwrap();
        metrics.connect_attempts_total.inc();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Arc::new(Registry::new());
        assert!(ConnectionMetrics::with_registry(registry.clone()).is_ok());
        assert!(ConnectionMetrics::with_registry(registry).is_err());
    }

    #[test]
    fn test_failures_by_kind() {
        let metrics = ConnectionMetrics::new().unwrap();
        metrics.record_failure(FailureKind::Liveness);
        metrics.record_failure(FailureKind::Liveness);
        metrics.record_failure(FailureKind::Transport);

        assert_eq!(metrics.failures_total.with_label_values(&["liveness"]).get(), 2);
        assert_eq!(metrics.failures_total.with_label_values(&["transport"]).get(), 1);
    }

    #[test]
    fn test_status_gauge_and_latency() {
        let metrics = ConnectionMetrics::new().unwrap();
        metrics.set_status(ObservedStatus::Connected);
        assert_eq!(metrics.status.get(), ObservedStatus::Connected.as_gauge());

        metrics.observe_latency(42);
        metrics.observe_latency(-5);
        assert_eq!(metrics.heartbeat_latency_ms.get_sample_count(), 1);
    }
}
