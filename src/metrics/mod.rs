//! Prometheus-based monitoring for the distributed task execution core
//! (§6): queue depth, worker counts, job outcomes, scaling events, circuit
//! state, and per-operation latency.

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};
pub use prometheus::{CIRCUIT_OPEN, JOBS_TOTAL, OPERATION_LATENCY, QUEUE_DEPTH, REGISTRY, SCALING_EVENTS_TOTAL, WORKERS};
