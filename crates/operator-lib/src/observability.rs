//! Observability for the operator
//!
//! Provides:
//! - Prometheus metrics (reconcile latency and outcomes, watch reconnects,
//!   monitored instances, scale actions, per-instance usage)
//! - Event-tagged structured logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Reconcile passes talk to the API server several times; buckets in seconds
const RECONCILE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

static GLOBAL_METRICS: OnceLock<OperatorMetricsInner> = OnceLock::new();

struct OperatorMetricsInner {
    reconcile_duration_seconds: Histogram,
    reconcile_total: IntCounterVec,
    watch_reconnects: IntCounter,
    monitored_instances: IntGauge,
    scale_actions: IntCounterVec,
    cleanup_failures: IntCounter,
    cpu_usage_percent: GaugeVec,
    memory_usage_percent: GaugeVec,
}

impl OperatorMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "canvas_operator_reconcile_duration_seconds",
                "Time spent on one reconciliation pass",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            reconcile_total: register_int_counter_vec!(
                "canvas_operator_reconcile_total",
                "Reconciliation passes by outcome",
                &["outcome"]
            )
            .expect("Failed to register reconcile_total"),

            watch_reconnects: register_int_counter!(
                "canvas_operator_watch_reconnects_total",
                "Number of times the instance watch was reopened"
            )
            .expect("Failed to register watch_reconnects"),

            monitored_instances: register_int_gauge!(
                "canvas_operator_monitored_instances",
                "Instances with a running load monitor"
            )
            .expect("Failed to register monitored_instances"),

            scale_actions: register_int_counter_vec!(
                "canvas_operator_scale_actions_total",
                "Backend scaling actions applied",
                &["direction"]
            )
            .expect("Failed to register scale_actions"),

            cleanup_failures: register_int_counter!(
                "canvas_operator_cleanup_failures_total",
                "Derived resources that could not be deleted"
            )
            .expect("Failed to register cleanup_failures"),

            cpu_usage_percent: register_gauge_vec!(
                "canvas_operator_backend_cpu_usage_percent",
                "Backend CPU usage relative to requests",
                &["instance"]
            )
            .expect("Failed to register cpu_usage_percent"),

            memory_usage_percent: register_gauge_vec!(
                "canvas_operator_backend_memory_usage_percent",
                "Backend memory usage relative to requests",
                &["instance"]
            )
            .expect("Failed to register memory_usage_percent"),
        }
    }
}

/// Handle to the process-wide metrics. Clones share the same series.
#[derive(Clone)]
pub struct OperatorMetrics {
    _private: (),
}

impl Default for OperatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(OperatorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &OperatorMetricsInner {
        GLOBAL_METRICS.get_or_init(OperatorMetricsInner::new)
    }

    pub fn observe_reconcile(&self, elapsed: Duration, success: bool) {
        let inner = self.inner();
        inner.reconcile_duration_seconds.observe(elapsed.as_secs_f64());
        let outcome = if success { "success" } else { "failure" };
        inner.reconcile_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_watch_reconnects(&self) {
        self.inner().watch_reconnects.inc();
    }

    pub fn set_monitored_instances(&self, count: usize) {
        self.inner().monitored_instances.set(count as i64);
    }

    pub fn inc_scale_action(&self, direction: &str) {
        self.inner()
            .scale_actions
            .with_label_values(&[direction])
            .inc();
    }

    pub fn inc_cleanup_failures(&self) {
        self.inner().cleanup_failures.inc();
    }

    pub fn set_usage(&self, instance: &str, cpu_percent: f64, memory_percent: f64) {
        let inner = self.inner();
        inner
            .cpu_usage_percent
            .with_label_values(&[instance])
            .set(cpu_percent);
        inner
            .memory_usage_percent
            .with_label_values(&[instance])
            .set(memory_percent);
    }

    /// Drop the per-instance series once an instance is gone
    pub fn forget_instance(&self, instance: &str) {
        let inner = self.inner();
        let _ = inner.cpu_usage_percent.remove_label_values(&[instance]);
        let _ = inner.memory_usage_percent.remove_label_values(&[instance]);
    }
}

/// Structured logger for lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    namespace: String,
}

impl StructuredLogger {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn log_reconcile_completed(&self, instance: &str, elapsed: Duration) {
        info!(
            event = "reconcile_completed",
            namespace = %self.namespace,
            instance = %instance,
            elapsed_ms = elapsed.as_millis() as u64,
            "Instance reconciled"
        );
    }

    pub fn log_reconcile_failed(&self, instance: &str, step: &str, err: &str) {
        error!(
            event = "reconcile_failed",
            namespace = %self.namespace,
            instance = %instance,
            step = %step,
            error = %err,
            "Reconciliation aborted"
        );
    }

    pub fn log_backend_scaled(
        &self,
        instance: &str,
        direction: &str,
        from_replicas: i32,
        to_replicas: i32,
        cpu_percent: f64,
    ) {
        info!(
            event = "backend_scaled",
            namespace = %self.namespace,
            instance = %instance,
            direction = %direction,
            from_replicas = from_replicas,
            to_replicas = to_replicas,
            cpu_percent = cpu_percent,
            "Scaled backend workload"
        );
    }

    pub fn log_instance_cleaned_up(&self, instance: &str, deleted: usize, absent: usize, failed: usize) {
        if failed == 0 {
            info!(
                event = "instance_cleaned_up",
                namespace = %self.namespace,
                instance = %instance,
                deleted = deleted,
                absent = absent,
                "Removed derived resources"
            );
        } else {
            warn!(
                event = "instance_cleaned_up",
                namespace = %self.namespace,
                instance = %instance,
                deleted = deleted,
                absent = absent,
                failed = failed,
                "Removed derived resources with failures"
            );
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "operator_started",
            namespace = %self.namespace,
            operator_version = %version,
            "Canvas operator started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "operator_shutdown",
            namespace = %self.namespace,
            reason = %reason,
            "Canvas operator shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_registry() {
        let metrics = OperatorMetrics::new();
        let other = OperatorMetrics::new();

        metrics.observe_reconcile(Duration::from_millis(20), true);
        other.observe_reconcile(Duration::from_millis(20), false);
        metrics.inc_watch_reconnects();
        metrics.set_monitored_instances(2);
        metrics.inc_scale_action("up");
        metrics.set_usage("room1", 42.0, 10.0);
        metrics.forget_instance("room1");

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "canvas_operator_reconcile_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("canvas");
        assert_eq!(logger.namespace, "canvas");
    }
}
