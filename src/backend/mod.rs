//! Orchestration Backend port: the abstract "make the number of workers of
//! type T equal to N" interface the Scaling Service drives (§6). This core
//! never implements worker logic itself — it only asks a backend to
//! converge a fleet to a target size.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use tracing::{debug, error, info, warn};

use crate::error::BackendError;

/// Abstract scaling backend (§6's Orchestration Backend port). Implementors
/// must be idempotent: calling `scale_to` twice in a row with no
/// intervening change is a no-op, and "already at target" is success, not
/// an error.
#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    /// Idempotently converges the number of `worker_type` workers to
    /// `target_count`. Returns `Ok(false)` (not an error) on a recoverable
    /// failure to converge; callers treat `false` as "retry next tick" and
    /// must not advance their cooldown clock on it.
    async fn scale_to(&self, worker_type: &str, target_count: usize) -> Result<bool, BackendError>;

    /// Current number of workers of `worker_type`, including ones that have
    /// not yet heart-beated. Returns `Ok(0)` if unknown, never an error for
    /// "none exist yet" — that is the cold-start case.
    async fn get_current_count(&self, worker_type: &str) -> Result<usize, BackendError>;
}

/// Scales worker types by directly creating/removing Docker containers,
/// labeled so a later listing call can find them again.
pub struct DockerApiBackend {
    docker: Docker,
    image: String,
    network: Option<String>,
    project_name: String,
    redis_url: String,
}

const LABEL_PROJECT: &str = "fleetforge.project";
const LABEL_WORKER_TYPE: &str = "fleetforge.worker.type";
const LABEL_WORKER_NUMBER: &str = "fleetforge.worker.number";

impl DockerApiBackend {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the daemon is unreachable.
    pub fn new(
        image: impl Into<String>,
        network: Option<String>,
        project_name: impl Into<String>,
        redis_url: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults().map_err(BackendError::Bollard)?;
        Ok(Self {
            docker,
            image: image.into(),
            network,
            project_name: project_name.into(),
            redis_url: redis_url.into(),
        })
    }

    fn container_name(&self, worker_type: &str, instance_num: usize) -> String {
        format!("{}_{}_{}", self.project_name, worker_type, instance_num)
    }

    async fn worker_containers(
        &self,
        worker_type: &str,
    ) -> Result<Vec<bollard::models::ContainerSummary>, BackendError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{LABEL_PROJECT}={}", self.project_name),
                format!("{LABEL_WORKER_TYPE}={worker_type}"),
            ],
        );
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        self.docker
            .list_containers(Some(options))
            .await
            .map_err(BackendError::Bollard)
    }

    fn instance_number(container: &bollard::models::ContainerSummary) -> usize {
        container
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_WORKER_NUMBER))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    async fn create_worker(
        &self,
        worker_type: &str,
        instance_num: usize,
    ) -> Result<(), BackendError> {
        let name = self.container_name(worker_type, instance_num);

        // Remove any pre-existing container with this name, e.g. left over
        // from a crashed previous attempt, so create doesn't 409.
        let _ = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        let mut labels = HashMap::new();
        labels.insert(LABEL_PROJECT.to_string(), self.project_name.clone());
        labels.insert(LABEL_WORKER_TYPE.to_string(), worker_type.to_string());
        labels.insert(LABEL_WORKER_NUMBER.to_string(), instance_num.to_string());

        let env = vec![
            format!("REDIS_URL={}", self.redis_url),
            format!("WORKER_TYPE={worker_type}"),
            format!("WORKER_ID={name}"),
        ];

        let host_config = HostConfig {
            network_mode: self.network.clone(),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.image.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(BackendError::Bollard)?;

        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(BackendError::Bollard)?;

        info!(container = %name, worker_type, "started worker container");
        Ok(())
    }

    async fn remove_worker(
        &self,
        container: &bollard::models::ContainerSummary,
    ) -> Result<(), BackendError> {
        let Some(id) = container.id.as_deref() else {
            return Ok(());
        };

        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(BackendError::Bollard)?;

        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(BackendError::Bollard)?;

        debug!(container = ?container.names, "removed worker container");
        Ok(())
    }
}

#[async_trait]
impl OrchestrationBackend for DockerApiBackend {
    async fn scale_to(&self, worker_type: &str, target_count: usize) -> Result<bool, BackendError> {
        let current = self.worker_containers(worker_type).await?;
        let current_count = current.len();

        if current_count == target_count {
            return Ok(true);
        }

        if current_count < target_count {
            for i in 0..(target_count - current_count) {
                if let Err(e) = self.create_worker(worker_type, current_count + i + 1).await {
                    error!(worker_type, error = %e, "failed to create worker container");
                    return Ok(false);
                }
            }
        } else {
            let mut sorted = current;
            sorted.sort_by_key(|c| std::cmp::Reverse(Self::instance_number(c)));
            for container in sorted.into_iter().take(current_count - target_count) {
                if let Err(e) = self.remove_worker(&container).await {
                    warn!(worker_type, error = %e, "failed to remove worker container");
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    async fn get_current_count(&self, worker_type: &str) -> Result<usize, BackendError> {
        Ok(self.worker_containers(worker_type).await?.len())
    }
}

/// Placeholder for orchestrator kinds named in §6's `ORCHESTRATOR` env var
/// enumeration that are not yet implemented. Every call fails with
/// `BackendError::NotImplemented` rather than panicking, so a misconfigured
/// deployment gets a clear error instead of undefined behavior.
pub struct UnimplementedBackend {
    kind: &'static str,
}

impl UnimplementedBackend {
    pub fn new(kind: &'static str) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl OrchestrationBackend for UnimplementedBackend {
    async fn scale_to(&self, _worker_type: &str, _target_count: usize) -> Result<bool, BackendError> {
        Err(BackendError::NotImplemented(self.kind.to_string()))
    }

    async fn get_current_count(&self, _worker_type: &str) -> Result<usize, BackendError> {
        Err(BackendError::NotImplemented(self.kind.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory fake backend for exercising callers without Docker.
    pub struct FakeBackend {
        counts: tokio::sync::Mutex<HashMap<String, usize>>,
        scale_to_calls: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self {
                counts: tokio::sync::Mutex::new(HashMap::new()),
                scale_to_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl OrchestrationBackend for FakeBackend {
        async fn scale_to(&self, worker_type: &str, target_count: usize) -> Result<bool, BackendError> {
            self.scale_to_calls.fetch_add(1, Ordering::SeqCst);
            self.counts
                .lock()
                .await
                .insert(worker_type.to_string(), target_count);
            Ok(true)
        }

        async fn get_current_count(&self, worker_type: &str) -> Result<usize, BackendError> {
            Ok(self.counts.lock().await.get(worker_type).copied().unwrap_or(0))
        }
    }

    #[tokio::test]
    async fn scale_to_is_idempotent_for_repeated_target() {
        let backend = FakeBackend::new();
        backend.scale_to("browser", 3).await.unwrap();
        backend.scale_to("browser", 3).await.unwrap();
        assert_eq!(backend.get_current_count("browser").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unimplemented_backend_reports_backend_error() {
        let backend = UnimplementedBackend::new("kubernetes");
        let err = backend.scale_to("browser", 1).await.unwrap_err();
        assert!(matches!(err, BackendError::NotImplemented(k) if k == "kubernetes"));
    }
}
