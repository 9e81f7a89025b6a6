//! Prometheus metrics registration and export for the distributed task
//! execution core. Exposed on `METRICS_PORT` (§6) alongside the health
//! surface in [`crate::http`].

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all fleetforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Queue depth, labeled by worker type.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Worker counts, labeled by worker type and `state` (`healthy`/`total`).
pub static WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs completed/failed, labeled by worker type and outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scaling events, labeled by worker type and decision
/// (`scale_up`/`scale_down`/`no_change`).
pub static SCALING_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Circuit breaker state per worker type: `1` if open, `0` if closed.
pub static CIRCUIT_OPEN: OnceLock<GaugeVec> = OnceLock::new();

/// Runtime façade operation latency, labeled by operation name.
pub static OPERATION_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initializes all metrics and registers them with the global registry.
/// Idempotent: a second call after a successful first call is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction or registration
/// fails, typically from a duplicate metric name.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let queue_depth = GaugeVec::new(
        Opts::new("fleetforge_queue_depth", "Number of jobs pending in a worker type's queue"),
        &["worker_type"],
    )?;

    let workers = GaugeVec::new(
        Opts::new("fleetforge_workers", "Number of workers known to a worker type's pool"),
        &["worker_type", "state"],
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("fleetforge_jobs_total", "Jobs completed or failed, by worker type"),
        &["worker_type", "outcome"],
    )?;

    let scaling_events_total = CounterVec::new(
        Opts::new("fleetforge_scaling_events_total", "Scaling decisions executed, by outcome"),
        &["worker_type", "decision"],
    )?;

    let circuit_open = GaugeVec::new(
        Opts::new("fleetforge_circuit_open", "1 if the circuit breaker for a worker type is open"),
        &["worker_type"],
    )?;

    let operation_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "fleetforge_operation_latency_seconds",
            "Runtime façade operation latency in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["operation"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(workers.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(scaling_events_total.clone()))?;
    registry.register(Box::new(circuit_open.clone()))?;
    registry.register(Box::new(operation_latency.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = WORKERS.set(workers);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = SCALING_EVENTS_TOTAL.set(scaling_events_total);
    let _ = CIRCUIT_OPEN.set(circuit_open);
    let _ = OPERATION_LATENCY.set(operation_latency);

    tracing::info!("prometheus metrics initialized");
    Ok(())
}

/// Gathers all registered metrics in Prometheus text exposition format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# metrics not initialized; call init_metrics() first\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# error encoding metrics: {e}\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| format!("# error converting metrics to utf-8: {e}\n"))
}

/// HTTP handler for `GET /metrics`.
pub async fn metrics_handler() -> String {
    export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok() || REGISTRY.get().is_some());
        assert!(init_metrics().is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn export_metrics_never_panics_before_init() {
        let text = export_metrics();
        assert!(!text.is_empty());
    }
}
