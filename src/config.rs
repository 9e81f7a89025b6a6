//! Environment-driven configuration for the distributed task execution core.
//!
//! A grouped settings struct, a `from_env()` constructor built on small
//! `parse_env_value`/`parse_env_bool` helpers so a malformed numeric env var
//! is a `ConfigError` rather than a panic, a `validate()` pass, and
//! builder-style setters for test construction.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating the distributed config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Which orchestration backend the scaling service drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorKind {
    DockerApi,
    Kubernetes,
    Fly,
}

impl FromStr for OrchestratorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker-api" => Ok(Self::DockerApi),
            "kubernetes" => Ok(Self::Kubernetes),
            "fly" => Ok(Self::Fly),
            other => Err(ConfigError::InvalidValue {
                key: "ORCHESTRATOR".to_string(),
                message: format!(
                    "unknown orchestrator '{other}', expected one of: docker-api, kubernetes, fly"
                ),
            }),
        }
    }
}

/// Per-worker-type autoscaling thresholds (§3 of the worker-fleet design).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
    pub cooldown_seconds: f64,
}

impl ScalingConfig {
    pub fn new(
        min_workers: usize,
        max_workers: usize,
        scale_up_threshold: usize,
        scale_down_threshold: usize,
        cooldown_seconds: f64,
    ) -> Self {
        Self {
            min_workers,
            max_workers,
            scale_up_threshold,
            scale_down_threshold,
            cooldown_seconds,
        }
    }
}

/// Static configuration for one worker type: its queue, heartbeat namespace,
/// and scaling thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerTypeConfig {
    pub name: String,
    pub job_queue_name: String,
    pub heartbeat_key_pattern: String,
    pub scaling: ScalingConfig,
    pub enabled: bool,
}

impl WorkerTypeConfig {
    pub fn new(name: impl Into<String>, scaling: ScalingConfig) -> Self {
        let name = name.into();
        Self {
            job_queue_name: format!("{name}:jobs"),
            heartbeat_key_pattern: format!("worker:heartbeat:{name}:*"),
            name,
            scaling,
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Top-level configuration for the distributed core, loaded once at startup
/// from the environment and treated as read-only for the rest of the
/// process.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    pub redis_url: String,
    pub orchestrator: OrchestratorKind,
    pub check_interval: Duration,
    pub worker_health_timeout: Duration,
    pub metrics_port: u16,
    pub manager_port: u16,
    pub log_level: String,
    pub job_stream: String,
    pub worker_types: HashMap<String, WorkerTypeConfig>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        let mut worker_types = HashMap::new();
        worker_types.insert(
            "browser".to_string(),
            WorkerTypeConfig::new("browser", ScalingConfig::new(1, 10, 1, 0, 60.0)),
        );
        worker_types.insert(
            "tankpit".to_string(),
            WorkerTypeConfig::new("tankpit", ScalingConfig::new(0, 50, 1, 2, 60.0)),
        );

        Self {
            redis_url: "redis://localhost:6379".to_string(),
            orchestrator: OrchestratorKind::DockerApi,
            check_interval: Duration::from_secs(30),
            worker_health_timeout: Duration::from_secs(90),
            metrics_port: 9090,
            manager_port: 8080,
            log_level: "info".to_string(),
            job_stream: "jobs".to_string(),
            worker_types,
        }
    }
}

impl DistributedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from the environment.
    ///
    /// # Environment variables
    ///
    /// - `REDIS_URL`, `ORCHESTRATOR`, `CHECK_INTERVAL`, `WORKER_HEALTH_TIMEOUT`,
    ///   `METRICS_PORT`, `MANAGER_PORT`, `LOG_LEVEL`, `JOB_STREAM`
    /// - `<TYPE>_MIN_WORKERS`, `_MAX_WORKERS`, `_SCALE_UP_THRESHOLD`,
    ///   `_SCALE_DOWN_THRESHOLD`, `_COOLDOWN` override the built-in `browser`
    ///   and `tankpit` worker types.
    /// - `CUSTOM_WORKER_TYPES` is a comma-separated list of additional type
    ///   names; a name is only registered if its `<TYPE>_JOB_QUEUE` env var
    ///   is also set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a numeric or enum-valued variable is
    /// malformed, or if the resulting configuration fails `validate()`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("ORCHESTRATOR") {
            config.orchestrator = val.parse()?;
        }

        if let Ok(val) = std::env::var("CHECK_INTERVAL") {
            let secs: u64 = parse_env_value(&val, "CHECK_INTERVAL")?;
            config.check_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("WORKER_HEALTH_TIMEOUT") {
            let secs: u64 = parse_env_value(&val, "WORKER_HEALTH_TIMEOUT")?;
            config.worker_health_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("METRICS_PORT") {
            config.metrics_port = parse_env_value(&val, "METRICS_PORT")?;
        }

        if let Ok(val) = std::env::var("MANAGER_PORT") {
            config.manager_port = parse_env_value(&val, "MANAGER_PORT")?;
        }

        if let Ok(val) = std::env::var("LOG_LEVEL") {
            config.log_level = val;
        }

        if let Ok(val) = std::env::var("JOB_STREAM") {
            config.job_stream = val;
        }

        for type_name in ["browser", "tankpit"] {
            if let Some(cfg) = config.worker_types.get_mut(type_name) {
                apply_scaling_overrides(type_name, &mut cfg.scaling)?;
            }
        }

        if let Ok(custom) = std::env::var("CUSTOM_WORKER_TYPES") {
            for raw_name in custom.split(',') {
                let name = raw_name.trim();
                if name.is_empty() {
                    continue;
                }
                let queue_var = format!("{}_JOB_QUEUE", env_prefix(name));
                if std::env::var(&queue_var).is_err() {
                    continue;
                }
                let mut scaling = ScalingConfig::new(0, 10, 1, 0, 60.0);
                apply_scaling_overrides(name, &mut scaling)?;
                config
                    .worker_types
                    .insert(name.to_string(), WorkerTypeConfig::new(name, scaling));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates `0 ≤ min ≤ max` and `down ≤ up` for every worker type.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` describing the first
    /// violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, cfg) in &self.worker_types {
            if cfg.scaling.min_workers > cfg.scaling.max_workers {
                return Err(ConfigError::ValidationFailed(format!(
                    "worker type '{name}': min_workers ({}) must be <= max_workers ({})",
                    cfg.scaling.min_workers, cfg.scaling.max_workers
                )));
            }
            if cfg.scaling.scale_down_threshold > cfg.scaling.scale_up_threshold {
                return Err(ConfigError::ValidationFailed(format!(
                    "worker type '{name}': scale_down_threshold ({}) must be <= scale_up_threshold ({})",
                    cfg.scaling.scale_down_threshold, cfg.scaling.scale_up_threshold
                )));
            }
            if cfg.scaling.cooldown_seconds < 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "worker type '{name}': cooldown_seconds must be >= 0"
                )));
            }
        }

        if self.metrics_port == self.manager_port {
            return Err(ConfigError::ValidationFailed(
                "METRICS_PORT and MANAGER_PORT must differ".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: OrchestratorKind) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_worker_health_timeout(mut self, timeout: Duration) -> Self {
        self.worker_health_timeout = timeout;
        self
    }

    pub fn with_worker_type(mut self, cfg: WorkerTypeConfig) -> Self {
        self.worker_types.insert(cfg.name.clone(), cfg);
        self
    }

    /// Enabled worker types, stably sorted by name.
    pub fn enabled_worker_types(&self) -> Vec<&WorkerTypeConfig> {
        let mut types: Vec<&WorkerTypeConfig> =
            self.worker_types.values().filter(|t| t.enabled).collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }
}

fn env_prefix(type_name: &str) -> String {
    type_name.to_uppercase()
}

fn apply_scaling_overrides(type_name: &str, scaling: &mut ScalingConfig) -> Result<(), ConfigError> {
    let prefix = env_prefix(type_name);

    if let Ok(val) = std::env::var(format!("{prefix}_MIN_WORKERS")) {
        scaling.min_workers = parse_env_value(&val, &format!("{prefix}_MIN_WORKERS"))?;
    }
    if let Ok(val) = std::env::var(format!("{prefix}_MAX_WORKERS")) {
        scaling.max_workers = parse_env_value(&val, &format!("{prefix}_MAX_WORKERS"))?;
    }
    if let Ok(val) = std::env::var(format!("{prefix}_SCALE_UP_THRESHOLD")) {
        scaling.scale_up_threshold = parse_env_value(&val, &format!("{prefix}_SCALE_UP_THRESHOLD"))?;
    }
    if let Ok(val) = std::env::var(format!("{prefix}_SCALE_DOWN_THRESHOLD")) {
        scaling.scale_down_threshold =
            parse_env_value(&val, &format!("{prefix}_SCALE_DOWN_THRESHOLD"))?;
    }
    if let Ok(val) = std::env::var(format!("{prefix}_COOLDOWN")) {
        scaling.cooldown_seconds = parse_env_value(&val, &format!("{prefix}_COOLDOWN"))?;
    }

    Ok(())
}

fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{value}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that touch process-wide env vars serialize against each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_include_browser_and_tankpit() {
        let config = DistributedConfig::default();
        assert!(config.worker_types.contains_key("browser"));
        assert!(config.worker_types.contains_key("tankpit"));
        assert_eq!(config.worker_types["browser"].scaling.min_workers, 1);
        assert_eq!(config.worker_types["tankpit"].scaling.min_workers, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn orchestrator_parses_known_values() {
        assert_eq!("docker-api".parse::<OrchestratorKind>().unwrap(), OrchestratorKind::DockerApi);
        assert_eq!("kubernetes".parse::<OrchestratorKind>().unwrap(), OrchestratorKind::Kubernetes);
        assert_eq!("fly".parse::<OrchestratorKind>().unwrap(), OrchestratorKind::Fly);
        assert!("ecs".parse::<OrchestratorKind>().is_err());
    }

    #[test]
    fn validate_rejects_min_greater_than_max() {
        let config = DistributedConfig::default()
            .with_worker_type(WorkerTypeConfig::new("browser", ScalingConfig::new(10, 1, 1, 0, 60.0)));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn validate_rejects_down_threshold_above_up_threshold() {
        let config = DistributedConfig::default()
            .with_worker_type(WorkerTypeConfig::new("browser", ScalingConfig::new(0, 10, 1, 5, 60.0)));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_colliding_ports() {
        let mut config = DistributedConfig::default();
        config.manager_port = config.metrics_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_env_applies_per_type_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BROWSER_MIN_WORKERS", "3");
        std::env::set_var("BROWSER_MAX_WORKERS", "20");
        let config = DistributedConfig::from_env().unwrap();
        assert_eq!(config.worker_types["browser"].scaling.min_workers, 3);
        assert_eq!(config.worker_types["browser"].scaling.max_workers, 20);
        std::env::remove_var("BROWSER_MIN_WORKERS");
        std::env::remove_var("BROWSER_MAX_WORKERS");
    }

    #[test]
    fn from_env_rejects_malformed_numeric_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BROWSER_MIN_WORKERS", "not-a-number");
        let result = DistributedConfig::from_env();
        assert!(result.is_err());
        std::env::remove_var("BROWSER_MIN_WORKERS");
    }

    #[test]
    fn from_env_loads_custom_worker_type_only_with_queue_var_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("CUSTOM_WORKER_TYPES", "scraper,ghost");
        std::env::set_var("SCRAPER_JOB_QUEUE", "scraper:jobs");
        let config = DistributedConfig::from_env().unwrap();
        assert!(config.worker_types.contains_key("scraper"));
        assert!(!config.worker_types.contains_key("ghost"));
        std::env::remove_var("CUSTOM_WORKER_TYPES");
        std::env::remove_var("SCRAPER_JOB_QUEUE");
    }

    #[test]
    fn enabled_worker_types_excludes_disabled() {
        let config = DistributedConfig::default().with_worker_type(
            WorkerTypeConfig::new("tankpit", ScalingConfig::new(0, 50, 1, 2, 60.0))
                .with_enabled(false),
        );
        let enabled: Vec<&str> = config
            .enabled_worker_types()
            .into_iter()
            .map(|t| t.name.as_str())
            .collect();
        assert!(enabled.contains(&"browser"));
        assert!(!enabled.contains(&"tankpit"));
    }

    #[test]
    fn worker_type_config_derives_queue_and_heartbeat_pattern() {
        let cfg = WorkerTypeConfig::new("browser", ScalingConfig::new(1, 10, 1, 0, 60.0));
        assert_eq!(cfg.job_queue_name, "browser:jobs");
        assert_eq!(cfg.heartbeat_key_pattern, "worker:heartbeat:browser:*");
    }
}
