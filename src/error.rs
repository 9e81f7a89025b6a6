//! Error types for the distributed task execution core.
//!
//! One `thiserror` enum per subsystem, composed via `#[from]` so a lower
//! layer's failure (Redis, bollard) surfaces as its caller's own error type
//! without manual wrapping at every call site.

use thiserror::Error;

/// Errors that can occur in the job broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("queue '{0}' is at capacity")]
    BrokerBackpressure(String),

    #[error("no result arrived within {0:?}")]
    TimedOut(std::time::Duration),

    #[error("job serialization failed: {0}")]
    MalformedJob(String),

    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported by the worker pool's heartbeat-driven registry.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("redis operation failed during heartbeat scan: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed heartbeat record for worker '{0}': {1}")]
    MalformedHeartbeat(String, String),

    #[error("worker '{0}' is not registered")]
    UnknownWorker(String),
}

/// Errors raised by the autoscaler control loop.
#[derive(Debug, Error)]
pub enum ScalingError {
    #[error("unknown worker type '{0}'")]
    UnknownWorkerType(String),

    #[error("orchestration backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors surfaced by the Orchestration Backend port.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend '{0}' is not implemented yet")]
    NotImplemented(String),

    #[error("bollard error: {0}")]
    Bollard(#[from] bollard::errors::Error),
}

/// Errors raised by the Runtime Façade / circuit breaker.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("operation timed out")]
    OperationTimeoutError,

    #[error("no healthy worker available: {0}")]
    WorkerUnavailableError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("browser action failed: {0}")]
    BrowserError(String),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}
