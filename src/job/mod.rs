//! Job and JobResult value types: the immutable unit of work passed between
//! the runtime façade, the broker, and workers.
//!
//! A `Job` is constructed once by [`new_job`] and never mutated afterwards;
//! every field required to route, execute, and reply to it is fixed at
//! construction time. Serialization is a self-describing JSON document so
//! that a worker in any language could, in principle, consume the same wire
//! format.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::BrokerError;

/// One unit of work: a dotted action name plus ordered/keyword arguments.
///
/// `job_type` carries the wire field name `type` (a reserved word in Rust),
/// e.g. `"browser.goto"`. The prefix up to the first `.` is the routing key
/// used by the broker (§4.2 of the worker-fleet design).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub reply_to: String,
    pub created_ts: f64,
}

impl Job {
    /// Returns the worker type this job routes to: the prefix of `job_type`
    /// up to (not including) the first `.`.
    pub fn worker_type(&self) -> &str {
        self.job_type.split('.').next().unwrap_or(&self.job_type)
    }
}

/// The outcome of executing a `Job`. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobResult {
    pub job_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobResultError>,
}

/// A structured error code/message pair carried by a failed `JobResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobResultError {
    pub code: String,
    pub message: String,
}

impl JobResult {
    /// Builds a successful result.
    pub fn success(job_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            job_id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Builds a failed result with a short machine-readable `code` and a
    /// human-readable `message`.
    pub fn failure(job_id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_id,
            success: false,
            result: None,
            error: Some(JobResultError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Constructs a fresh `Job`: assigns a new id, stamps `created_ts` with the
/// current wall-clock time, and derives `reply_to` as `results.<type>`.
pub fn new_job(
    job_type: impl Into<String>,
    args: Vec<serde_json::Value>,
    kwargs: serde_json::Map<String, serde_json::Value>,
) -> Job {
    let job_type = job_type.into();
    let reply_to = format!("results.{job_type}");
    Job {
        id: Uuid::new_v4(),
        job_type,
        args,
        kwargs,
        reply_to,
        created_ts: now_secs(),
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Serializes a `Job` to its self-describing wire form.
pub fn dumps(job: &Job) -> Result<String, BrokerError> {
    serde_json::to_string(job).map_err(BrokerError::from)
}

/// Parses a `Job` from its wire form. Unknown fields are rejected as
/// `MalformedJob`, per the serialization invariant.
pub fn loads(blob: &str) -> Result<Job, BrokerError> {
    serde_json::from_str(blob).map_err(|e| BrokerError::MalformedJob(e.to_string()))
}

/// Serializes a `JobResult` to its wire form.
pub fn dumps_result(result: &JobResult) -> Result<String, BrokerError> {
    serde_json::to_string(result).map_err(BrokerError::from)
}

/// Parses a `JobResult` from its wire form.
pub fn loads_result(blob: &str) -> Result<JobResult, BrokerError> {
    serde_json::from_str(blob).map_err(|e| BrokerError::MalformedJob(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_kwargs() -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("timeout".to_string(), json!(30));
        m
    }

    #[test]
    fn new_job_derives_reply_to_from_type() {
        let job = new_job("browser.goto", vec![json!("https://example.com")], sample_kwargs());
        assert_eq!(job.reply_to, "results.browser.goto");
        assert_eq!(job.worker_type(), "browser");
    }

    #[test]
    fn new_job_stamps_recent_timestamp() {
        let before = now_secs();
        let job = new_job("tankpit.spawn", vec![], serde_json::Map::new());
        let after = now_secs();
        assert!(job.created_ts >= before && job.created_ts <= after);
    }

    #[test]
    fn serialization_round_trip_preserves_fields_and_arg_order() {
        let job = new_job(
            "browser.click",
            vec![json!("#submit"), json!(true), json!(3)],
            sample_kwargs(),
        );
        let blob = dumps(&job).unwrap();
        let parsed = loads(&blob).unwrap();
        assert_eq!(job, parsed);
        assert_eq!(parsed.args, vec![json!("#submit"), json!(true), json!(3)]);
    }

    #[test]
    fn loads_rejects_unknown_fields_as_malformed() {
        let blob = r#"{
            "id": "3fa85f64-5717-4562-b3fc-2c963f66afa6",
            "type": "browser.goto",
            "args": [],
            "kwargs": {},
            "reply_to": "results.browser.goto",
            "created_ts": 1.0,
            "unexpected_field": "oops"
        }"#;
        let err = loads(blob).unwrap_err();
        assert!(matches!(err, BrokerError::MalformedJob(_)));
    }

    #[test]
    fn loads_rejects_missing_required_field() {
        let blob = r#"{"id": "3fa85f64-5717-4562-b3fc-2c963f66afa6", "type": "browser.goto"}"#;
        assert!(loads(blob).is_err());
    }

    #[test]
    fn job_result_success_round_trip() {
        let job_id = Uuid::new_v4();
        let result = JobResult::success(job_id, json!({"ok": true}));
        let blob = dumps_result(&result).unwrap();
        let parsed = loads_result(&blob).unwrap();
        assert_eq!(result, parsed);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn job_result_failure_round_trip() {
        let job_id = Uuid::new_v4();
        let result = JobResult::failure(job_id, "timeout", "operation timed out");
        let blob = dumps_result(&result).unwrap();
        let parsed = loads_result(&blob).unwrap();
        assert_eq!(result, parsed);
        assert!(parsed.result.is_none());
        assert_eq!(parsed.error.unwrap().code, "timeout");
    }

    #[test]
    fn routing_scenario_known_and_unknown_prefix() {
        let known = new_job("tankpit.spawn", vec![json!("usw1")], serde_json::Map::new());
        assert_eq!(known.worker_type(), "tankpit");

        let unknown = new_job("unknown.frob", vec![], serde_json::Map::new());
        assert_eq!(unknown.worker_type(), "unknown");
    }
}
