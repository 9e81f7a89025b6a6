//! Redis-backed job broker: publishes jobs onto per-worker-type streams and
//! routes results back on a reply channel, using consumer-group semantics
//! for at-least-once delivery.
//!
//! Jobs live on Redis Streams (`XADD`/`XREADGROUP`/`XACK`) rather than plain
//! Lists, because consumer groups are what give us redelivery of a job whose
//! worker died before acknowledging it. Replies are pushed to a per-job
//! Redis List, since each `reply_to` channel is consumed by exactly one
//! waiter.

use std::collections::HashSet;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::job::{self, Job, JobResult};

/// Maximum number of retries for a transient broker operation.
const MAX_RETRIES: u32 = 3;
/// Minimum backoff between retries.
const MIN_RETRY_DELAY_MS: u64 = 1000;
/// Maximum backoff between retries.
const MAX_RETRY_DELAY_MS: u64 = 10_000;
/// Longest a single blocking read is allowed to wait, so loops remain
/// cancellation-responsive (§5: "no suspension point may block indefinitely").
const CONSUME_BLOCK_MS: usize = 1000;

/// Redis-backed implementation of the job broker (C2).
pub struct Broker {
    redis: ConnectionManager,
    known_worker_types: HashSet<String>,
    catch_all_stream: String,
    max_stream_len: u64,
}

impl Broker {
    /// Connects to Redis and builds a broker that knows how to route
    /// `job.type` prefixes in `known_worker_types` to their own stream, and
    /// everything else to `catch_all_stream`.
    pub async fn connect(
        redis_url: &str,
        known_worker_types: HashSet<String>,
        catch_all_stream: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::BrokerUnavailable(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::BrokerUnavailable(e.to_string()))?;

        Ok(Self {
            redis,
            known_worker_types,
            catch_all_stream: catch_all_stream.into(),
            max_stream_len: 10_000,
        })
    }

    /// Builds a broker from an already-connected `ConnectionManager`, for
    /// sharing one connection across the broker, pool, and scaling service.
    pub fn from_connection(
        redis: ConnectionManager,
        known_worker_types: HashSet<String>,
        catch_all_stream: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            known_worker_types,
            catch_all_stream: catch_all_stream.into(),
            max_stream_len: 10_000,
        }
    }

    /// Sets the per-queue backpressure ceiling (default 10,000 entries).
    pub fn with_max_stream_len(mut self, max_stream_len: u64) -> Self {
        self.max_stream_len = max_stream_len;
        self
    }

    /// Routing rule (§4.2, exact): `X:jobs` if `X` is a configured worker
    /// type, otherwise the catch-all stream.
    pub fn queue_name_for(&self, job_type: &str) -> String {
        route(job_type, &self.known_worker_types, &self.catch_all_stream)
    }

    /// Places `job` on its routed stream. Fire-and-forget: does not wait for
    /// a worker to pick it up. Rejects with `BrokerBackpressure` if the
    /// stream's true backlog (undelivered + unacknowledged, not raw `XLEN`
    /// which only ever grows) is already at `max_stream_len`.
    pub async fn publish(&self, job: &Job) -> Result<(), BrokerError> {
        let stream = self.queue_name_for(&job.job_type);
        self.with_retry(|| self.publish_once(&stream, job)).await
    }

    async fn publish_once(&self, stream: &str, job: &Job) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let group = assumed_group_for(stream);
        let depth = crate::redis_support::true_stream_depth(&mut conn, stream, group).await?;
        if depth as u64 >= self.max_stream_len {
            return Err(BrokerError::BrokerBackpressure(stream.to_string()));
        }

        let payload = job::dumps(job)?;
        let _id: String = conn.xadd(stream, "*", &[("job", payload)]).await?;
        Ok(())
    }

    /// Publishes `job` and awaits a `JobResult` on `job.reply_to` within
    /// `timeout`. Polls with bounded blocking reads so no connection is held
    /// open indefinitely; returns `TimedOut` at the deadline.
    pub async fn publish_and_wait(
        &self,
        job: &Job,
        timeout: Duration,
    ) -> Result<JobResult, BrokerError> {
        self.publish(job).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut conn = self.redis.clone();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::TimedOut(timeout));
            }
            let block_secs = remaining.as_secs().clamp(0, 1).max(1);

            let reply: Option<(String, String)> = conn
                .blpop(&job.reply_to, block_secs as f64)
                .await?;

            if let Some((_, payload)) = reply {
                return job::loads_result(&payload);
            }
        }
    }

    /// Reads the next job for `worker_type` under consumer group `group` and
    /// consumer name `consumer`, blocking up to one second. Returns
    /// `(entry_id, job)` so the caller can `ack` it later, or `None` as the
    /// `TimedOut` sentinel when nothing arrived in the interval (callers are
    /// expected to loop).
    ///
    /// Idempotently creates the stream and consumer group on first use;
    /// "group already exists" is not an error, and a missing group
    /// discovered mid-read is created and the read retried once.
    pub async fn consume(
        &self,
        group: &str,
        consumer: &str,
        worker_type: &str,
    ) -> Result<Option<(String, Job)>, BrokerError> {
        let stream = format!("{worker_type}:jobs");
        self.ensure_group(&stream, group).await?;

        match self.read_one(&stream, group, consumer).await {
            Ok(entry) => Ok(entry),
            Err(BrokerError::Redis(e)) if e.to_string().contains("NOGROUP") => {
                self.ensure_group(&stream, group).await?;
                self.read_one(&stream, group, consumer)
                    .await
                    .map_err(Into::into)
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, "$").await;

        if let Err(e) = result {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(BrokerError::from(e));
            }
        }
        Ok(())
    }

    async fn read_one(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<(String, Job)>, BrokerError> {
        let mut conn = self.redis.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(CONSUME_BLOCK_MS);

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &opts).await?;

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let payload: String = entry
                    .map
                    .get("job")
                    .and_then(|v| match v {
                        redis::Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
                        _ => None,
                    })
                    .ok_or_else(|| BrokerError::MalformedJob("missing 'job' field".to_string()))?;

                let job = job::loads(&payload)?;
                return Ok(Some((entry.id, job)));
            }
        }

        Ok(None)
    }

    /// Acknowledges `entry_id` on `worker_type`'s stream under `group`,
    /// retiring it from the pending-entries list so it is not redelivered.
    pub async fn ack(&self, worker_type: &str, group: &str, entry_id: &str) -> Result<(), BrokerError> {
        let stream = format!("{worker_type}:jobs");
        let mut conn = self.redis.clone();
        conn.xack(&stream, group, &[entry_id]).await?;
        Ok(())
    }

    /// Pushes `result` onto `job.reply_to`.
    pub async fn reply(&self, job: &Job, result: &JobResult) -> Result<(), BrokerError> {
        let payload = job::dumps_result(result)?;
        let mut conn = self.redis.clone();
        conn.rpush(&job.reply_to, payload).await?;
        Ok(())
    }

    /// Exponential backoff retry wrapper for transient broker errors
    /// (min 1s, max 10s, 3 retries), per §7's propagation policy.
    async fn with_retry<F, Fut, T>(&self, op: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, BrokerError>>,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay_ms = (MIN_RETRY_DELAY_MS * (1 << (attempt - 1))).min(MAX_RETRY_DELAY_MS);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                debug!(attempt = attempt + 1, delay_ms, "retrying broker operation");
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(BrokerError::BrokerBackpressure(q)) => {
                    return Err(BrokerError::BrokerBackpressure(q));
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "transient broker error");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BrokerError::BrokerUnavailable("exhausted retries".to_string())))
    }
}

/// Pure routing logic, factored out so it is testable without a live
/// connection: `X:jobs` if `X` is a configured worker type, else the
/// catch-all stream.
fn route(job_type: &str, known_worker_types: &HashSet<String>, catch_all_stream: &str) -> String {
    let prefix = job_type.split('.').next().unwrap_or(job_type);
    if known_worker_types.contains(prefix) {
        format!("{prefix}:jobs")
    } else {
        catch_all_stream.to_string()
    }
}

/// The consumer group a stream's backlog is measured against follows the
/// `<type>:jobs` / group-`<type>` convention (§6): strip the `:jobs` suffix
/// to recover the worker type. The catch-all stream has no dedicated worker
/// type, so its own name is used as the assumed group; `true_stream_depth`
/// falls back to `XLEN` when no such group exists yet, which is exactly
/// right before anything has ever consumed from it.
fn assumed_group_for(stream: &str) -> &str {
    stream.strip_suffix(":jobs").unwrap_or(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn known_types() -> HashSet<String> {
        ["browser".to_string(), "tankpit".to_string()]
            .into_iter()
            .collect()
    }

    #[test]
    fn routing_known_type_goes_to_its_own_stream() {
        let types = known_types();
        assert_eq!(route("tankpit.spawn", &types, "jobs"), "tankpit:jobs");
        assert_eq!(route("browser.goto", &types, "jobs"), "browser:jobs");
    }

    #[test]
    fn routing_unknown_type_goes_to_catch_all() {
        let types = known_types();
        assert_eq!(route("unknown.frob", &types, "jobs"), "jobs");
    }

    #[test]
    fn assumed_group_strips_jobs_suffix() {
        assert_eq!(assumed_group_for("tankpit:jobs"), "tankpit");
        assert_eq!(assumed_group_for("jobs"), "jobs");
    }
}
