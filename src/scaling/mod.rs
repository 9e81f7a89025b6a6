//! Autoscaler control loop (C4): reads queue depth and backend-reported
//! worker counts, decides scale-up/down per worker type, and drives an
//! [`crate::backend::OrchestrationBackend`] to carry it out.
//!
//! The decision function itself (`decide`) is pure and synchronous so it can
//! be unit-tested without Redis or a backend; [`ScalingService`] wires it to
//! live queue depth and pool health on a fixed tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backend::OrchestrationBackend;
use crate::config::DistributedConfig;
use crate::error::ScalingError;
use crate::metrics::MetricsCollector;
use crate::pool::WorkerPool;

/// Bound on the in-memory scaling history ring buffer (§3).
const HISTORY_CAPACITY: usize = 1000;
/// Bound on the `scaling:events` Redis stream (§6).
const EVENTS_STREAM_MAXLEN: u64 = 1000;

/// The outcome of a scaling decision for one worker type on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    NoChange,
}

impl ScalingDecision {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::NoChange => "no_change",
        }
    }
}

/// One recorded scaling action, kept for diagnostics and `/metrics`.
#[derive(Debug, Clone)]
pub struct ScalingEvent {
    pub timestamp: f64,
    pub worker_type: String,
    pub decision: ScalingDecision,
    pub from_count: usize,
    pub to_count: usize,
}

/// Pure decision function (§4.4, exact). No cooldown applies to scale-up or
/// to the `min_workers` floor; only scale-down is cooldown-gated.
pub fn decide(
    config: &DistributedConfig,
    worker_type: &str,
    queue_depth: usize,
    current_workers: usize,
    last_scale_time: Option<f64>,
    now: f64,
) -> (ScalingDecision, usize) {
    let Some(cfg) = config.worker_types.get(worker_type) else {
        return (ScalingDecision::NoChange, current_workers);
    };
    if !cfg.enabled {
        return (ScalingDecision::NoChange, current_workers);
    }
    let scaling = &cfg.scaling;

    if current_workers < scaling.min_workers {
        return (ScalingDecision::ScaleUp, scaling.min_workers);
    }

    if queue_depth >= scaling.scale_up_threshold && current_workers < scaling.max_workers {
        return (
            ScalingDecision::ScaleUp,
            (current_workers + 1).min(scaling.max_workers),
        );
    }

    let since_last = now - last_scale_time.unwrap_or(0.0);
    if since_last < scaling.cooldown_seconds {
        return (ScalingDecision::NoChange, current_workers);
    }

    if queue_depth <= scaling.scale_down_threshold && current_workers > scaling.min_workers {
        return (
            ScalingDecision::ScaleDown,
            (current_workers.saturating_sub(1)).max(scaling.min_workers),
        );
    }

    (ScalingDecision::NoChange, current_workers)
}

/// Closes the control loop described in §4.4: every `check_interval`, for
/// each enabled worker type, reads queue depth and current worker count,
/// calls [`decide`], and executes through the configured backend.
pub struct ScalingService {
    redis: ConnectionManager,
    config: DistributedConfig,
    backend: Arc<dyn OrchestrationBackend>,
    pools: HashMap<String, Arc<WorkerPool>>,
    last_scale_time: Mutex<HashMap<String, f64>>,
    history: Mutex<Vec<ScalingEvent>>,
}

impl ScalingService {
    pub fn new(
        redis: ConnectionManager,
        config: DistributedConfig,
        backend: Arc<dyn OrchestrationBackend>,
    ) -> Self {
        let pools = config
            .worker_types
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    Arc::new(WorkerPool::new(name.clone(), config.worker_health_timeout)),
                )
            })
            .collect();

        Self {
            redis,
            config,
            backend,
            pools,
            last_scale_time: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn pool(&self, worker_type: &str) -> Option<Arc<WorkerPool>> {
        self.pools.get(worker_type).cloned()
    }

    /// True backlog for a worker type's stream via [`crate::redis_support`],
    /// not plain `XLEN` (which counts every job ever `XADD`'d and only
    /// grows, since `ack` only removes entries from the pending list, not
    /// the stream). The consumer group is named after the worker type, per
    /// the `<type>:jobs` / group-`<type>` convention (§6).
    pub async fn queue_depth(&self, worker_type: &str) -> Result<usize, ScalingError> {
        let Some(cfg) = self.config.worker_types.get(worker_type) else {
            return Ok(0);
        };
        let mut conn = self.redis.clone();
        let depth =
            crate::redis_support::true_stream_depth(&mut conn, &cfg.job_queue_name, worker_type)
                .await?;
        Ok(depth)
    }

    /// Scans `worker:heartbeat:<type>:*` for every configured type and
    /// refreshes that type's pool, evicting stale entries.
    pub async fn update_worker_health(&self) {
        let metrics = MetricsCollector::new();
        for (worker_type, pool) in &self.pools {
            if let Err(e) = pool.refresh_from_redis(&self.redis).await {
                error!(worker_type = %worker_type, error = %e, "failed to refresh worker health");
                continue;
            }
            let stats = pool.statistics().await;
            metrics.update_workers(worker_type, stats.healthy, stats.total);
        }
    }

    /// Runs one decide-and-execute pass for `worker_type` and returns
    /// whether the backend call (if any) succeeded.
    pub async fn check_and_scale_one(&self, worker_type: &str) -> Result<bool, ScalingError> {
        let queue_depth = self.queue_depth(worker_type).await?;
        MetricsCollector::new().update_queue_depth(worker_type, queue_depth);
        let current = self.backend.get_current_count(worker_type).await?;

        let last_scale_time = {
            let history = self.last_scale_time.lock().await;
            history.get(worker_type).copied()
        };
        let now = now_secs();

        let (decision, target) = decide(
            &self.config,
            worker_type,
            queue_depth,
            current,
            last_scale_time,
            now,
        );

        if decision == ScalingDecision::NoChange {
            return Ok(true);
        }

        info!(
            worker_type,
            from = current,
            to = target,
            decision = decision.as_str(),
            "executing scaling decision"
        );

        let success = self.backend.scale_to(worker_type, target).await?;

        if success {
            let mut history = self.last_scale_time.lock().await;
            history.insert(worker_type.to_string(), now);
            drop(history);

            MetricsCollector::new().record_scaling_event(worker_type, decision.as_str());

            self.record_event(ScalingEvent {
                timestamp: now,
                worker_type: worker_type.to_string(),
                decision,
                from_count: current,
                to_count: target,
            })
            .await;
        } else {
            warn!(worker_type, target, "backend reported scaling failure");
        }

        Ok(success)
    }

    /// One full tick (§4.4 per-tick sequence): refresh pool health, then
    /// decide-and-execute for every enabled worker type.
    pub async fn check_and_scale_all(&self) -> HashMap<String, bool> {
        self.update_worker_health().await;

        let mut results = HashMap::new();
        for cfg in self.config.enabled_worker_types() {
            let outcome = match self.check_and_scale_one(&cfg.name).await {
                Ok(success) => success,
                Err(e) => {
                    error!(worker_type = %cfg.name, error = %e, "scaling tick failed");
                    false
                }
            };
            results.insert(cfg.name.clone(), outcome);
        }
        results
    }

    /// Runs `check_and_scale_all` on `config.check_interval` until
    /// `shutdown` fires. Autoscaler errors are logged and never propagated
    /// (§7): the loop always continues to the next tick.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.check_and_scale_all().await;
                }
                _ = shutdown.recv() => {
                    info!("scaling service shutting down");
                    break;
                }
            }
        }
    }

    async fn record_event(&self, event: ScalingEvent) {
        {
            let mut history = self.history.lock().await;
            history.push(event.clone());
            if history.len() > HISTORY_CAPACITY {
                let overflow = history.len() - HISTORY_CAPACITY;
                history.drain(0..overflow);
            }
        }

        let mut conn = self.redis.clone();
        let fields = [
            ("worker_type", event.worker_type.as_str()),
            ("decision", event.decision.as_str()),
            ("from_count", &event.from_count.to_string()),
            ("to_count", &event.to_count.to_string()),
            ("timestamp", &event.timestamp.to_string()),
        ];
        let result: redis::RedisResult<String> = redis::cmd("XADD")
            .arg("scaling:events")
            .arg("MAXLEN")
            .arg("~")
            .arg(EVENTS_STREAM_MAXLEN)
            .arg("*")
            .arg(&fields)
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            warn!(error = %e, "failed to record scaling event in redis");
        }
    }

    /// Snapshot of recent scaling history, most recent last.
    pub async fn history(&self) -> Vec<ScalingEvent> {
        self.history.lock().await.clone()
    }

    /// Most recent scale time per worker type, for diagnostics.
    pub async fn last_scale_times(&self) -> HashMap<String, f64> {
        self.last_scale_time.lock().await.clone()
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScalingConfig, WorkerTypeConfig};

    fn config_with(scaling: ScalingConfig) -> DistributedConfig {
        DistributedConfig::default().with_worker_type(WorkerTypeConfig::new("browser", scaling))
    }

    #[test]
    fn min_workers_floor_ignores_cooldown() {
        let config = config_with(ScalingConfig::new(2, 10, 5, 1, 60.0));
        let (decision, target) = decide(&config, "browser", 0, 0, Some(0.0), 1.0);
        assert_eq!(decision, ScalingDecision::ScaleUp);
        assert_eq!(target, 2);
    }

    #[test]
    fn scale_up_threshold_boundary() {
        let config = config_with(ScalingConfig::new(0, 10, 5, 1, 60.0));
        let (below, _) = decide(&config, "browser", 4, 2, None, 100.0);
        assert_eq!(below, ScalingDecision::NoChange);

        let (at, target) = decide(&config, "browser", 5, 2, None, 100.0);
        assert_eq!(at, ScalingDecision::ScaleUp);
        assert_eq!(target, 3);
    }

    #[test]
    fn scale_up_ignores_cooldown() {
        let config = config_with(ScalingConfig::new(0, 10, 1, 0, 60.0));
        let (decision, target) = decide(&config, "browser", 5, 2, Some(99.0), 100.0);
        assert_eq!(decision, ScalingDecision::ScaleUp);
        assert_eq!(target, 3);
    }

    #[test]
    fn scale_down_suppressed_within_cooldown() {
        let config = config_with(ScalingConfig::new(0, 10, 5, 1, 60.0));
        let (decision, target) = decide(&config, "browser", 0, 3, Some(50.0), 100.0);
        assert_eq!(decision, ScalingDecision::NoChange);
        assert_eq!(target, 3);
    }

    #[test]
    fn scale_down_after_cooldown_elapses() {
        let config = config_with(ScalingConfig::new(0, 10, 5, 1, 60.0));
        let (decision, target) = decide(&config, "browser", 0, 3, Some(30.0), 100.0);
        assert_eq!(decision, ScalingDecision::ScaleDown);
        assert_eq!(target, 2);
    }

    #[test]
    fn capped_at_max_stays_no_change() {
        let config = config_with(ScalingConfig::new(0, 5, 1, 0, 60.0));
        let (decision, target) = decide(&config, "browser", 100, 5, Some(0.0), 1000.0);
        assert_eq!(decision, ScalingDecision::NoChange);
        assert_eq!(target, 5);
    }

    #[test]
    fn disabled_worker_type_never_scales() {
        let scaling = ScalingConfig::new(1, 10, 1, 0, 60.0);
        let config = DistributedConfig::default()
            .with_worker_type(WorkerTypeConfig::new("browser", scaling).with_enabled(false));
        let (decision, target) = decide(&config, "browser", 50, 0, None, 100.0);
        assert_eq!(decision, ScalingDecision::NoChange);
        assert_eq!(target, 0);
    }

    #[test]
    fn cold_start_scale_from_zero_scenario() {
        let config = config_with(ScalingConfig::new(0, 5, 1, 0, 60.0));
        let (decision, target) = decide(&config, "browser", 1, 0, None, 0.0);
        assert_eq!(decision, ScalingDecision::ScaleUp);
        assert_eq!(target, 1);
    }

    #[test]
    fn unknown_worker_type_is_no_change() {
        let config = DistributedConfig::default();
        let (decision, target) = decide(&config, "ghost", 99, 0, None, 0.0);
        assert_eq!(decision, ScalingDecision::NoChange);
        assert_eq!(target, 0);
    }
}
