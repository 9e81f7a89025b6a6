//! Command-line interface for fleetforge: the composition root that wires
//! the job broker, worker pools, scaling service, orchestration backend,
//! and HTTP health/metrics surface into a running process.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use crate::backend::{DockerApiBackend, OrchestrationBackend, UnimplementedBackend};
use crate::config::{DistributedConfig, OrchestratorKind};
use crate::http::{self, AppState};
use crate::pool::WorkerPool;
use crate::scaling::{self, ScalingService};

/// fleetforge: distributed task execution core for a multi-frontend
/// browser-automation assistant.
#[derive(Parser)]
#[command(name = "fleetforge")]
#[command(about = "Job broker, worker fleet, and autoscaler for remote browser-automation workers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the control plane: broker health loop, worker pools, autoscaler,
    /// and the `/health` + `/metrics` HTTP surface.
    Serve,

    /// Print the scaling decision for one worker type given a hypothetical
    /// queue depth and current worker count, without touching Redis or a
    /// backend. Useful for validating `ScalingConfig` thresholds.
    Decide(DecideArgs),

    /// Connect to Redis, refresh every configured worker type's pool from
    /// its heartbeat keyspace, and print a one-shot status snapshot.
    Status,
}

#[derive(Parser, Debug)]
pub struct DecideArgs {
    /// Worker type name, as configured in `DistributedConfig`.
    pub worker_type: String,

    /// Hypothetical queue depth.
    pub queue_depth: usize,

    /// Hypothetical current worker count.
    pub current_workers: usize,

    /// Seconds since the worker type last scaled (omit for "never").
    #[arg(long)]
    pub seconds_since_last_scale: Option<f64>,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve => run_serve().await,
        Commands::Decide(args) => run_decide(args).await,
        Commands::Status => run_status().await,
    }
}

async fn run_serve() -> anyhow::Result<()> {
    let config = DistributedConfig::from_env()?;
    crate::metrics::init_metrics().ok();

    let client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(client).await?;

    let backend = build_backend(&config)?;

    let scaling = Arc::new(ScalingService::new(redis.clone(), config.clone(), backend));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let scaling_task = tokio::spawn({
        let scaling = Arc::clone(&scaling);
        let shutdown_rx = shutdown_tx.subscribe();
        async move { scaling.run(shutdown_rx).await }
    });

    let pools: Vec<Arc<WorkerPool>> = config
        .worker_types
        .keys()
        .filter_map(|name| scaling.pool(name))
        .collect();

    let state = AppState {
        pools,
        scaling: Arc::clone(&scaling),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.manager_port));
    let http_task = tokio::spawn(async move { http::serve(addr, state).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    scaling_task.abort();
    http_task.abort();

    Ok(())
}

async fn run_decide(args: DecideArgs) -> anyhow::Result<()> {
    let config = DistributedConfig::from_env().unwrap_or_default();
    let now = 0.0;
    let last_scale_time = args.seconds_since_last_scale.map(|secs| now - secs);

    let (decision, target) = scaling::decide(
        &config,
        &args.worker_type,
        args.queue_depth,
        args.current_workers,
        last_scale_time,
        now,
    );

    println!(
        "{{\"worker_type\":\"{}\",\"decision\":\"{:?}\",\"target_count\":{}}}",
        args.worker_type, decision, target
    );
    Ok(())
}

async fn run_status() -> anyhow::Result<()> {
    let config = DistributedConfig::from_env()?;
    let client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(client).await?;

    for cfg in config.enabled_worker_types() {
        let pool = WorkerPool::new(cfg.name.clone(), config.worker_health_timeout);
        pool.refresh_from_redis(&redis).await?;
        let stats = pool.statistics().await;
        println!(
            "{}: healthy={} total={} completed={} failed={} success_rate={:.2}",
            cfg.name, stats.healthy, stats.total, stats.jobs_completed, stats.jobs_failed, stats.success_rate()
        );
    }

    Ok(())
}

fn build_backend(config: &DistributedConfig) -> anyhow::Result<Arc<dyn OrchestrationBackend>> {
    let backend: Arc<dyn OrchestrationBackend> = match config.orchestrator {
        OrchestratorKind::DockerApi => Arc::new(DockerApiBackend::new(
            std::env::var("WORKER_IMAGE").unwrap_or_else(|_| "fleetforge-worker:latest".to_string()),
            std::env::var("WORKER_NETWORK").ok(),
            "fleetforge",
            config.redis_url.clone(),
        )?),
        OrchestratorKind::Kubernetes => Arc::new(UnimplementedBackend::new("kubernetes")),
        OrchestratorKind::Fly => Arc::new(UnimplementedBackend::new("fly")),
    };
    Ok(backend)
}
