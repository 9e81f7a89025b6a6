//! Runtime Façade with Circuit Breaker (C5): the single surface frontends
//! call. Converts a high-level action into a [`crate::job::Job`], submits
//! it through the [`crate::broker::Broker`], awaits the reply where
//! applicable, and fails fast when the fleet is degraded.
//!
//! This is a near-verbatim port of the source's `CircuitBreakerRuntime`
//! (`_guard`) and `RetryableRuntime` (`_retry_with_backoff`), fused into one
//! façade since both wrap the same handful of operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use serde_json::{json, Value};
use tracing::warn;

use crate::broker::Broker;
use crate::error::{BrokerError, RuntimeError};
use crate::job::{self, JobResult};
use crate::metrics::MetricsCollector;

/// Consecutive failures that trip the breaker.
const MAX_FAILS: u32 = 3;
/// How long the breaker stays open once tripped.
const COOLDOWN: Duration = Duration::from_secs(30);
/// Default deadline for a single `publish_and_wait` round trip.
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);
/// Retries for the idempotent-operation backoff layer (1s, 2s).
const IDEMPOTENT_RETRIES: u32 = 2;

/// Circuit breaker state, mutex-guarded per §5 (no global lock; one owner).
struct CircuitState {
    fails: AtomicU32,
    opened_until: Mutex<Option<Instant>>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            fails: AtomicU32::new(0),
            opened_until: Mutex::new(None),
        }
    }

    fn is_open(&self) -> bool {
        match *self.opened_until.lock().unwrap() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    fn record_success(&self) {
        self.fails.store(0, Ordering::SeqCst);
        *self.opened_until.lock().unwrap() = None;
    }

    /// Records a failure that counts toward the breaker and trips it at
    /// `MAX_FAILS`. Returns the new consecutive-failure count.
    fn record_failure(&self) -> u32 {
        let fails = self.fails.fetch_add(1, Ordering::SeqCst) + 1;
        if fails >= MAX_FAILS {
            *self.opened_until.lock().unwrap() = Some(Instant::now() + COOLDOWN);
            warn!(fails, cooldown_secs = COOLDOWN.as_secs(), "circuit breaker open");
        }
        fails
    }

    fn failure_count(&self) -> u32 {
        self.fails.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.fails.store(0, Ordering::SeqCst);
        *self.opened_until.lock().unwrap() = None;
    }
}

/// Status payload returned by [`RuntimeFacade::status`].
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct StatusReport {
    pub healthy: bool,
    #[serde(default)]
    pub detail: Value,
}

/// The frontend-facing surface (§4.5). Every method here is what a chat/web
/// adapter calls; nothing upstream of this type knows about jobs, queues,
/// or workers.
pub struct RuntimeFacade {
    broker: Broker,
    worker_type: String,
    job_timeout: Duration,
    circuit: CircuitState,
}

impl RuntimeFacade {
    pub fn new(broker: Broker, worker_type: impl Into<String>) -> Self {
        Self {
            broker,
            worker_type: worker_type.into(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            circuit: CircuitState::new(),
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Whether the breaker is presently refusing calls.
    pub fn is_circuit_open(&self) -> bool {
        self.circuit.is_open()
    }

    /// Current consecutive-failure count.
    pub fn failure_count(&self) -> u32 {
        self.circuit.failure_count()
    }

    /// Manually resets the breaker (admin/test use).
    pub fn reset_circuit(&self) {
        self.circuit.reset();
    }

    fn job_type(&self, action: &str) -> String {
        format!("{}.{action}", self.worker_type)
    }

    /// Submits `browser.goto` and awaits success. Not retried at this layer:
    /// at-least-once delivery from the broker is the only safety net for
    /// non-idempotent operations.
    pub async fn goto(&self, url: &str) -> Result<(), RuntimeError> {
        if url.trim().is_empty() {
            return Err(RuntimeError::InvalidArgument("url must not be empty".to_string()));
        }
        let job = job::new_job(self.job_type("goto"), vec![json!(url)], Default::default());
        self.guard("goto", self.publish_and_wait(&job)).await?;
        Ok(())
    }

    /// Submits `browser.click` fire-and-forget.
    pub async fn click(&self, selector: &str) -> Result<(), RuntimeError> {
        let job = job::new_job(self.job_type("click"), vec![json!(selector)], Default::default());
        self.guard("click", self.publish_fire_and_forget(&job)).await
    }

    /// Submits `browser.screenshot`, awaits the result, and base64-decodes
    /// it. Idempotent: wrapped in the retry-with-backoff layer.
    pub async fn screenshot(&self) -> Result<Vec<u8>, RuntimeError> {
        let encoded = self
            .retry_idempotent("screenshot", || async {
                let job = job::new_job(self.job_type("screenshot"), vec![], Default::default());
                let result = self.guard("screenshot", self.publish_and_wait(&job)).await?;
                let payload = result
                    .result
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| {
                        RuntimeError::BrowserError("screenshot result missing payload".to_string())
                    })?;
                Ok(payload)
            })
            .await?;

        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| RuntimeError::BrowserError(format!("invalid base64 screenshot: {e}")))
    }

    /// Submits `browser.status`, awaits the result. Idempotent: retried.
    pub async fn status(&self) -> Result<StatusReport, RuntimeError> {
        self.retry_idempotent("status", || async {
            let job = job::new_job(self.job_type("status"), vec![], Default::default());
            let result = self.guard("status", self.publish_and_wait(&job)).await?;
            let payload = result.result.unwrap_or(Value::Null);
            serde_json::from_value(payload)
                .map_err(|e| RuntimeError::BrowserError(format!("malformed status payload: {e}")))
        })
        .await
    }

    /// Starts a new session. Not retried (non-idempotent).
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let job = job::new_job(self.job_type("start"), vec![], Default::default());
        self.guard("start", self.publish_and_wait(&job)).await?;
        Ok(())
    }

    /// Tears down all sessions on the worker side. Not retried.
    pub async fn cleanup_all(&self) -> Result<(), RuntimeError> {
        let job = job::new_job(self.job_type("cleanup_all"), vec![], Default::default());
        self.guard("cleanup_all", self.publish_and_wait(&job)).await?;
        Ok(())
    }

    async fn publish_and_wait(&self, job: &job::Job) -> Result<JobResult, RuntimeError> {
        let result = self.broker.publish_and_wait(job, self.job_timeout).await?;
        if !result.success {
            let err = result.error.unwrap_or_else(|| job::JobResultError {
                code: "unknown".to_string(),
                message: "worker reported failure with no detail".to_string(),
            });
            if is_invalid_argument_code(&err.code) {
                return Err(RuntimeError::InvalidArgument(err.message));
            }
            return Err(RuntimeError::BrowserError(format!("{}: {}", err.code, err.message)));
        }
        Ok(result)
    }

    async fn publish_fire_and_forget(&self, job: &job::Job) -> Result<(), RuntimeError> {
        self.broker.publish(job).await?;
        Ok(())
    }

    /// Circuit breaker guard (§4.5, `_guard` equivalent): fails fast while
    /// open, re-maps broker/worker errors to the public taxonomy on
    /// failure, and resets the failure count on success. `InvalidArgument`
    /// never reaches here — callers validate before constructing a job.
    async fn guard<Fut, T>(&self, operation: &str, op: Fut) -> Result<T, RuntimeError>
    where
        Fut: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        let metrics = MetricsCollector::new();

        if self.circuit.is_open() {
            return Err(RuntimeError::WorkerUnavailableError(format!(
                "circuit open after {} consecutive failures",
                self.circuit.failure_count()
            )));
        }

        let started = Instant::now();
        let outcome = op.await;
        metrics.record_operation_latency(operation, started.elapsed().as_secs_f64());

        match outcome {
            Ok(value) => {
                self.circuit.record_success();
                metrics.set_circuit_open(&self.worker_type, false);
                Ok(value)
            }
            Err(e) => {
                if matches!(e, RuntimeError::InvalidArgument(_)) {
                    return Err(e);
                }
                self.circuit.record_failure();
                metrics.set_circuit_open(&self.worker_type, self.circuit.is_open());
                Err(remap_error(e))
            }
        }
    }

    /// Exponential backoff retry for idempotent operations only (1s, 2s).
    async fn retry_idempotent<F, Fut, T>(&self, name: &str, op: F) -> Result<T, RuntimeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        let mut last_err = None;
        for attempt in 0..=IDEMPOTENT_RETRIES {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < IDEMPOTENT_RETRIES {
                        let backoff = Duration::from_secs(1 << attempt);
                        warn!(operation = name, attempt = attempt + 1, ?backoff, error = %e, "retrying");
                        tokio::time::sleep(backoff).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one attempt always runs"))
    }
}

/// Re-maps a broker/worker-facing error to the public taxonomy (§7):
/// timeouts and connectivity errors become their own kinds, everything else
/// is an opaque `BrowserError`.
///
/// Checks the structured `BrokerError` variants first: `BrokerError::TimedOut`'s
/// Display ("no result arrived within ...") doesn't contain the word
/// "timeout", so a substring match alone would silently misclassify the
/// broker's own deadline as a generic failure.
fn remap_error(err: RuntimeError) -> RuntimeError {
    if matches!(err, RuntimeError::OperationTimeoutError | RuntimeError::WorkerUnavailableError(_)) {
        return err;
    }

    match err {
        RuntimeError::Broker(BrokerError::TimedOut(_)) => return RuntimeError::OperationTimeoutError,
        RuntimeError::Broker(BrokerError::BrokerUnavailable(reason)) => {
            return RuntimeError::WorkerUnavailableError(reason)
        }
        _ => {}
    }

    let message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        RuntimeError::OperationTimeoutError
    } else if lower.contains("unavailable") || lower.contains("connection") {
        RuntimeError::WorkerUnavailableError(message)
    } else {
        RuntimeError::BrowserError(message)
    }
}

/// Whether a worker-reported error `code` denotes an invalid-argument
/// outcome (§4.5: these don't count toward the circuit breaker). Normalizes
/// away separators and case so `"invalid_argument"`, `"InvalidArgument"`,
/// and `"invalid-argument"` all match.
fn is_invalid_argument_code(code: &str) -> bool {
    let normalized: String = code.chars().filter(|c| c.is_alphanumeric()).collect();
    normalized.eq_ignore_ascii_case("invalidargument")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32 as Counter, Ordering as CounterOrdering};

    #[test]
    fn circuit_opens_after_max_fails_and_resets_on_success() {
        let circuit = CircuitState::new();
        assert!(!circuit.is_open());

        circuit.record_failure();
        circuit.record_failure();
        assert!(!circuit.is_open());

        circuit.record_failure();
        assert!(circuit.is_open());

        circuit.reset();
        assert!(!circuit.is_open());
        assert_eq!(circuit.failure_count(), 0);
    }

    #[test]
    fn success_resets_failure_count() {
        let circuit = CircuitState::new();
        circuit.record_failure();
        circuit.record_failure();
        assert_eq!(circuit.failure_count(), 2);
        circuit.record_success();
        assert_eq!(circuit.failure_count(), 0);
    }

    #[test]
    fn remap_classifies_timeout_and_unavailable() {
        let timeout = remap_error(RuntimeError::BrowserError("operation timed out".to_string()));
        assert!(matches!(timeout, RuntimeError::OperationTimeoutError));

        let unavailable =
            remap_error(RuntimeError::BrowserError("connection refused".to_string()));
        assert!(matches!(unavailable, RuntimeError::WorkerUnavailableError(_)));

        let other = remap_error(RuntimeError::BrowserError("bad selector".to_string()));
        assert!(matches!(other, RuntimeError::BrowserError(_)));
    }

    #[test]
    fn remap_classifies_structured_broker_timeout_and_unavailable() {
        let timeout = remap_error(RuntimeError::Broker(BrokerError::TimedOut(
            Duration::from_secs(30),
        )));
        assert!(matches!(timeout, RuntimeError::OperationTimeoutError));

        let unavailable = remap_error(RuntimeError::Broker(BrokerError::BrokerUnavailable(
            "connection refused".to_string(),
        )));
        assert!(matches!(unavailable, RuntimeError::WorkerUnavailableError(_)));
    }

    #[test]
    fn invalid_argument_code_matches_regardless_of_separator_style() {
        assert!(is_invalid_argument_code("invalid_argument"));
        assert!(is_invalid_argument_code("InvalidArgument"));
        assert!(is_invalid_argument_code("invalid-argument"));
        assert!(!is_invalid_argument_code("timeout"));
    }

    #[tokio::test]
    async fn retry_idempotent_gives_up_after_configured_attempts() {
        let circuit = CircuitState::new();
        let _ = &circuit;
        let calls = Counter::new(0);

        let facade_calls = &calls;
        let attempt_fn = || async {
            facade_calls.fetch_add(1, CounterOrdering::SeqCst);
            Err::<(), RuntimeError>(RuntimeError::BrowserError("boom".to_string()))
        };

        // Exercise the same retry arithmetic the façade uses, without a
        // live broker: IDEMPOTENT_RETRIES=2 means 3 total attempts.
        let mut last = None;
        for attempt in 0..=IDEMPOTENT_RETRIES {
            match attempt_fn().await {
                Ok(()) => unreachable!(),
                Err(e) => last = Some((attempt, e)),
            }
        }
        assert_eq!(calls.load(CounterOrdering::SeqCst), IDEMPOTENT_RETRIES + 1);
        assert!(last.is_some());
    }
}
