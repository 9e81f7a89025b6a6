//! High-level recording interface over the raw Prometheus metrics in
//! [`super::prometheus`]. Mirrors that module's labels 1:1 so callers never
//! construct label arrays themselves.

use super::prometheus::{CIRCUIT_OPEN, JOBS_TOTAL, OPERATION_LATENCY, QUEUE_DEPTH, SCALING_EVENTS_TOTAL, WORKERS};

/// Thin, stateless wrapper around the metrics registry. Safe to construct
/// freely and share across tasks; every method is a no-op until
/// [`super::init_metrics`] has run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Updates the queue depth gauge for one worker type.
    pub fn update_queue_depth(&self, worker_type: &str, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.with_label_values(&[worker_type]).set(depth as f64);
        }
    }

    /// Updates both the healthy and total worker counts for one worker type.
    pub fn update_workers(&self, worker_type: &str, healthy: usize, total: usize) {
        if let Some(gauge) = WORKERS.get() {
            gauge.with_label_values(&[worker_type, "healthy"]).set(healthy as f64);
            gauge.with_label_values(&[worker_type, "total"]).set(total as f64);
        }
    }

    /// Records one job outcome for a worker type.
    pub fn record_job(&self, worker_type: &str, success: bool) {
        if let Some(counter) = JOBS_TOTAL.get() {
            let outcome = if success { "completed" } else { "failed" };
            counter.with_label_values(&[worker_type, outcome]).inc();
        }
    }

    /// Records one scaling decision for a worker type.
    pub fn record_scaling_event(&self, worker_type: &str, decision: &str) {
        if let Some(counter) = SCALING_EVENTS_TOTAL.get() {
            counter.with_label_values(&[worker_type, decision]).inc();
        }
    }

    /// Sets the circuit-open gauge for a worker type.
    pub fn set_circuit_open(&self, worker_type: &str, open: bool) {
        if let Some(gauge) = CIRCUIT_OPEN.get() {
            gauge.with_label_values(&[worker_type]).set(if open { 1.0 } else { 0.0 });
        }
    }

    /// Records the latency of one runtime façade operation.
    pub fn record_operation_latency(&self, operation: &str, seconds: f64) {
        if let Some(hist) = OPERATION_LATENCY.get() {
            hist.with_label_values(&[operation]).observe(seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn recording_never_panics_once_initialized() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth("browser", 5);
        collector.update_workers("browser", 3, 4);
        collector.record_job("browser", true);
        collector.record_job("browser", false);
        collector.record_scaling_event("browser", "scale_up");
        collector.set_circuit_open("browser", true);
        collector.set_circuit_open("browser", false);
        collector.record_operation_latency("goto", 0.25);
    }

    #[test]
    fn recording_before_init_is_a_silent_no_op() {
        // Exercises the `.get()` branches directly; harmless if another
        // test in this binary already called init_metrics().
        let collector = MetricsCollector::new();
        collector.update_queue_depth("uninitialized-type", 1);
    }
}
