//! Prometheus self-metrics for the inventory controller

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

/// Node reconciliations by outcome (ok, requeued, error)
static NODE_RECONCILES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "ginv_node_reconciliations_total",
            "Total node reconciliations"
        ),
        &["outcome"]
    )
    .expect("Failed to create node_reconciliations metric")
});

/// Node reconciliation duration histogram
static RECONCILE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ginv_node_reconcile_duration_seconds",
        "Duration of node reconciliations",
        &["node"],
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to create reconcile_duration metric")
});

/// Devices currently published per node
static DEVICE_COUNT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("ginv_devices", "GPU devices published per node"),
        &["node"]
    )
    .expect("Failed to create devices metric")
});

/// Agent source failures (telemetry, detection)
static SOURCE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "ginv_source_failures_total",
            "Agent source collection failures"
        ),
        &["node", "source"]
    )
    .expect("Failed to create source_failures metric")
});

/// Device health transitions (degraded, recovered)
static HEALTH_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "ginv_device_health_transitions_total",
            "Device health transitions"
        ),
        &["device", "transition"]
    )
    .expect("Failed to create health_transitions metric")
});

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*NODE_RECONCILES;
        let _ = &*RECONCILE_DURATION;
        let _ = &*DEVICE_COUNT;
        let _ = &*SOURCE_FAILURES;
        let _ = &*HEALTH_TRANSITIONS;
        Self
    }

    pub fn inc_reconcile(&self, outcome: &str) {
        NODE_RECONCILES.with_label_values(&[outcome]).inc();
    }

    pub fn observe_reconcile_duration(&self, node: &str, duration_secs: f64) {
        RECONCILE_DURATION
            .with_label_values(&[node])
            .observe(duration_secs);
    }

    pub fn set_device_count(&self, node: &str, count: i64) {
        DEVICE_COUNT.with_label_values(&[node]).set(count);
    }

    pub fn inc_source_failure(&self, node: &str, source: &str) {
        SOURCE_FAILURES.with_label_values(&[node, source]).inc();
    }

    pub fn inc_health_transition(&self, device: &str, transition: &str) {
        HEALTH_TRANSITIONS
            .with_label_values(&[device, transition])
            .inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();
        registry.inc_reconcile("ok");
        registry.observe_reconcile_duration("node-a", 0.12);
        registry.set_device_count("node-a", 4);
        registry.inc_source_failure("node-a", "telemetry");
        registry.inc_health_transition("node-a-0-10de-1db4", "degraded");
    }
}
