//! IP set reconciler metrics.

use prometheus::{Gauge, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Observability hooks called by the reconciler.
pub trait IpSetsMetrics {
    /// Number of IP sets currently tracked.
    fn set_num_ip_sets(&self, n: usize);

    /// One named operation, e.g. `"resync-bpf-ipsets"`.
    fn record_operation(&self, op: &'static str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl IpSetsMetrics for NoopMetrics {
    fn set_num_ip_sets(&self, _n: usize) {}

    fn record_operation(&self, _op: &'static str) {}
}

/// Prometheus-backed metrics.
#[derive(Clone)]
pub struct PrometheusIpSetsMetrics {
    pub num_ip_sets: Gauge,
    pub operations_total: IntCounterVec,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl PrometheusIpSetsMetrics {
    /// Creates the metrics on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Creates the metrics on a caller-supplied registry.
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let num_ip_sets = Gauge::with_opts(Opts::new(
            "felix_bpf_num_ip_sets",
            "Number of BPF IP sets managed in the dataplane.",
        ))?;
        registry.register(Box::new(num_ip_sets.clone()))?;

        let operations_total = IntCounterVec::new(
            Opts::new(
                "felix_bpf_ipset_operations_total",
                "Number of IP set dataplane operations, by type.",
            ),
            &["op"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        Ok(Self {
            num_ip_sets,
            operations_total,
            registry,
        })
    }
}

impl IpSetsMetrics for PrometheusIpSetsMetrics {
    fn set_num_ip_sets(&self, n: usize) {
        self.num_ip_sets.set(n as f64);
    }

    fn record_operation(&self, op: &'static str) {
        self.operations_total.with_label_values(&[op]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PrometheusIpSetsMetrics::new().unwrap();
        assert_eq!(metrics.num_ip_sets.get(), 0.0);

        metrics.set_num_ip_sets(3);
        assert_eq!(metrics.num_ip_sets.get(), 3.0);
    }

    #[test]
    fn test_record_operation() {
        let metrics = PrometheusIpSetsMetrics::new().unwrap();
        metrics.record_operation("resync-bpf-ipsets");
        metrics.record_operation("resync-bpf-ipsets");
        assert_eq!(
            metrics
                .operations_total
                .with_label_values(&["resync-bpf-ipsets"])
                .get(),
            2
        );
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Arc::new(Registry::new());
        PrometheusIpSetsMetrics::with_registry(registry.clone()).unwrap();
        assert!(PrometheusIpSetsMetrics::with_registry(registry).is_err());
    }
}
