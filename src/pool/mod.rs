//! Worker fleet registry (C3): an in-memory, mutex-guarded view of which
//! workers of one type are alive, fed by heartbeats written to Redis.
//!
//! The pool itself never talks to a worker process directly; it only
//! observes the heartbeat keyspace (`worker:heartbeat:<type>:*`) on a
//! periodic scan and derives liveness from it. [`HeartbeatWriter`] is the
//! other half of that external contract: a small helper a worker process
//! runs to keep its own record fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::metrics::MetricsCollector;

/// Health of one worker as tracked by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Healthy,
    Unhealthy(String),
}

/// Everything the pool knows about one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: String,
    pub worker_type: String,
    pub capabilities: serde_json::Value,
    pub status: WorkerStatus,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub registered_at: f64,
    pub last_heartbeat: f64,
}

impl WorkerInfo {
    fn new(id: String, worker_type: String, capabilities: serde_json::Value, now: f64) -> Self {
        Self {
            id,
            worker_type,
            capabilities,
            status: WorkerStatus::Healthy,
            jobs_completed: 0,
            jobs_failed: 0,
            registered_at: now,
            last_heartbeat: now,
        }
    }
}

/// Aggregate view of a pool's health, for metrics and diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStatistics {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

impl PoolStatistics {
    pub fn success_rate(&self) -> f64 {
        let total = self.jobs_completed + self.jobs_failed;
        if total == 0 {
            return 1.0;
        }
        self.jobs_completed as f64 / total as f64
    }
}

/// One heartbeat record as written by a worker and read back by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub timestamp: f64,
    pub state: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

/// In-memory registry of live workers of one type.
pub struct WorkerPool {
    worker_type: String,
    health_timeout: Duration,
    workers: Mutex<HashMap<String, WorkerInfo>>,
}

impl WorkerPool {
    pub fn new(worker_type: impl Into<String>, health_timeout: Duration) -> Self {
        Self {
            worker_type: worker_type.into(),
            health_timeout,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    /// Inserts or refreshes a worker's record. `registered_at` is preserved
    /// across refreshes; only `last_heartbeat` and `status` move.
    pub async fn register(&self, worker_id: &str, capabilities: serde_json::Value) {
        let now = now_secs();
        let mut workers = self.workers.lock().await;
        workers
            .entry(worker_id.to_string())
            .and_modify(|w| {
                w.last_heartbeat = now;
                w.status = WorkerStatus::Healthy;
                w.capabilities = capabilities.clone();
            })
            .or_insert_with(|| {
                WorkerInfo::new(worker_id.to_string(), self.worker_type.clone(), capabilities, now)
            });
    }

    pub async fn mark_healthy(&self, worker_id: &str) -> Result<(), PoolError> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
        worker.status = WorkerStatus::Healthy;
        Ok(())
    }

    pub async fn mark_unhealthy(&self, worker_id: &str, reason: impl Into<String>) -> Result<(), PoolError> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
        worker.status = WorkerStatus::Unhealthy(reason.into());
        Ok(())
    }

    pub async fn record_job_completed(&self, worker_id: &str) -> Result<(), PoolError> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
        worker.jobs_completed += 1;
        drop(workers);
        MetricsCollector::new().record_job(&self.worker_type, true);
        Ok(())
    }

    pub async fn record_job_failed(&self, worker_id: &str) -> Result<(), PoolError> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
        worker.jobs_failed += 1;
        drop(workers);
        MetricsCollector::new().record_job(&self.worker_type, false);
        Ok(())
    }

    /// Workers with `status == Healthy` whose last heartbeat is within
    /// `health_timeout`. A worker is eligible for job dispatch only if it
    /// appears here.
    pub async fn healthy_workers(&self) -> Vec<WorkerInfo> {
        let now = now_secs();
        let timeout_secs = self.health_timeout.as_secs_f64();
        let workers = self.workers.lock().await;
        workers
            .values()
            .filter(|w| w.status == WorkerStatus::Healthy && now - w.last_heartbeat <= timeout_secs)
            .cloned()
            .collect()
    }

    /// Drops entries whose heartbeat is older than `health_timeout` and
    /// returns their ids. Idempotent: a second call in a row removes
    /// nothing further.
    pub async fn remove_stale(&self) -> Vec<String> {
        let now = now_secs();
        let timeout_secs = self.health_timeout.as_secs_f64();
        let mut workers = self.workers.lock().await;

        let stale: Vec<String> = workers
            .iter()
            .filter(|(_, w)| now - w.last_heartbeat > timeout_secs)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            workers.remove(id);
        }

        stale
    }

    pub async fn statistics(&self) -> PoolStatistics {
        let now = now_secs();
        let timeout_secs = self.health_timeout.as_secs_f64();
        let workers = self.workers.lock().await;

        let mut stats = PoolStatistics::default();
        stats.total = workers.len();
        for w in workers.values() {
            let live = w.status == WorkerStatus::Healthy && now - w.last_heartbeat <= timeout_secs;
            if live {
                stats.healthy += 1;
            } else {
                stats.unhealthy += 1;
            }
            stats.jobs_completed += w.jobs_completed;
            stats.jobs_failed += w.jobs_failed;
        }
        stats
    }

    /// Refreshes the registry by scanning `worker:heartbeat:<type>:*` and
    /// registering/refreshing every worker whose record parses.
    pub async fn refresh_from_redis(&self, redis: &ConnectionManager) -> Result<(), PoolError> {
        let pattern = format!("worker:heartbeat:{}:*", self.worker_type);
        let mut conn = redis.clone();

        let keys: Vec<String> = conn.keys(&pattern).await?;

        for key in keys {
            let worker_id = key.rsplit(':').next().unwrap_or(&key).to_string();
            let raw: Option<String> = conn.get(&key).await?;
            let Some(raw) = raw else { continue };

            match serde_json::from_str::<HeartbeatRecord>(&raw) {
                Ok(record) => {
                    self.register(&worker_id, record.capabilities).await;
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "malformed heartbeat record, skipping");
                }
            }
        }

        let removed = self.remove_stale().await;
        if !removed.is_empty() {
            debug!(worker_type = %self.worker_type, removed = ?removed, "evicted stale workers");
        }

        Ok(())
    }
}

/// Writes a worker's own heartbeat record at a fixed interval. This is the
/// producing half of the heartbeat contract `WorkerPool::refresh_from_redis`
/// consumes; it carries no scaling logic of its own.
pub struct HeartbeatWriter {
    redis: ConnectionManager,
    key: String,
    interval: Duration,
    capabilities: serde_json::Value,
}

impl HeartbeatWriter {
    pub fn new(
        redis: ConnectionManager,
        worker_type: &str,
        worker_id: &str,
        interval: Duration,
        capabilities: serde_json::Value,
    ) -> Self {
        Self {
            redis,
            key: format!("worker:heartbeat:{worker_type}:{worker_id}"),
            interval,
            capabilities,
        }
    }

    /// Writes one heartbeat record immediately, with a TTL of 3x the
    /// configured interval so a crashed worker's record expires on its own.
    pub async fn write_once(&self) -> Result<(), PoolError> {
        let record = HeartbeatRecord {
            timestamp: now_secs(),
            state: "running".to_string(),
            capabilities: self.capabilities.clone(),
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| PoolError::MalformedHeartbeat(self.key.clone(), e.to_string()))?;

        let ttl = (self.interval.as_secs() * 3).max(1);
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(&self.key, payload, ttl).await?;
        Ok(())
    }

    /// Runs the write loop until `shutdown` fires.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.write_once().await {
                        warn!(key = %self.key, error = %e, "failed to write heartbeat");
                    }
                }
                _ = shutdown.recv() => {
                    debug!(key = %self.key, "heartbeat writer shutting down");
                    break;
                }
            }
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub type SharedWorkerPool = Arc<WorkerPool>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_then_healthy_workers_contains_it() {
        let pool = WorkerPool::new("browser", Duration::from_secs(90));
        pool.register("w1", json!({"max_sessions": 4})).await;

        let healthy = pool.healthy_workers().await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "w1");
    }

    #[tokio::test]
    async fn register_preserves_registered_at_on_refresh() {
        let pool = WorkerPool::new("browser", Duration::from_secs(90));
        pool.register("w1", json!({})).await;
        let first = pool.healthy_workers().await[0].registered_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.register("w1", json!({})).await;
        let second = pool.healthy_workers().await[0].registered_at;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn mark_unhealthy_removes_worker_from_healthy_set() {
        let pool = WorkerPool::new("browser", Duration::from_secs(90));
        pool.register("w1", json!({})).await;
        pool.mark_unhealthy("w1", "browser crashed").await.unwrap();

        assert!(pool.healthy_workers().await.is_empty());
        let stats = pool.statistics().await;
        assert_eq!(stats.unhealthy, 1);
    }

    #[tokio::test]
    async fn job_counters_increment_independently() {
        let pool = WorkerPool::new("browser", Duration::from_secs(90));
        pool.register("w1", json!({})).await;
        pool.record_job_completed("w1").await.unwrap();
        pool.record_job_completed("w1").await.unwrap();
        pool.record_job_failed("w1").await.unwrap();

        let stats = pool.statistics().await;
        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.jobs_failed, 1);
        assert!((stats.success_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stale_worker_is_excluded_and_removed_exactly_once() {
        let pool = WorkerPool::new("browser", Duration::from_millis(1));
        pool.register("w1", json!({})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pool.healthy_workers().await.is_empty());

        let removed_first = pool.remove_stale().await;
        assert_eq!(removed_first, vec!["w1".to_string()]);

        let removed_second = pool.remove_stale().await;
        assert!(removed_second.is_empty());
    }

    #[tokio::test]
    async fn operations_on_unknown_worker_return_error() {
        let pool = WorkerPool::new("browser", Duration::from_secs(90));
        assert!(pool.mark_healthy("ghost").await.is_err());
        assert!(pool.record_job_completed("ghost").await.is_err());
    }
}
