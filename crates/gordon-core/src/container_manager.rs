//! Tracks managed containers and drives their lifecycle against the
//! `ContainerRuntime` abstraction.
//!
//! The domain→container map is a `tokio::sync::Mutex`-backed registry with
//! health tracking (`reload`, `mark_unhealthy`, `check_all_health`). An async
//! mutex is used rather than a sync `RwLock` because updates happen from
//! async handlers that await while holding related state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gordon_runtime::{ContainerRuntime, ContainerSpec, ContainerStatus};

use crate::error::CoreError;

const INTERNAL_NETWORK: &str = "gordon-internal";
const STOP_TIMEOUT_SECS: u32 = 30;
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Route {
    pub domain: String,
    pub image: String,
}

#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub domain: String,
    pub container_id: String,
    pub image: String,
    pub status: ContainerStatus,
    pub host_port: Option<u16>,
    pub internal_ip: Option<String>,
    pub internal_port: Option<u16>,
}

/// Upstream address the reverse proxy can dial, in whichever form the
/// runtime made available.
#[derive(Debug, Clone)]
pub enum UpstreamTarget {
    HostPort(u16),
    InternalAddr(String, u16),
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    containers: Mutex<HashMap<String, ManagedContainer>>,
}

fn container_name(domain: &str) -> String {
    format!("gordon-{}", domain.replace('.', "-"))
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory map from whatever the runtime reports as
    /// `gordon.managed=true`. Cancelling `ctx` stops the sweep before the
    /// next container inspect; whatever was rebuilt so far is still applied.
    pub async fn sync_containers(&self, ctx: &CancellationToken) -> Result<(), CoreError> {
        info!("syncing managed containers from runtime");
        let summaries = self.runtime.list_containers(true).await?;

        let mut rebuilt = HashMap::new();
        for summary in summaries {
            if ctx.is_cancelled() {
                break;
            }
            let Some(domain) = summary.labels.get("gordon.route").cloned() else {
                continue;
            };
            let image = summary
                .labels
                .get("gordon.image")
                .cloned()
                .unwrap_or(summary.image);

            let details = self.runtime.inspect_container(&summary.id).await.ok();
            let (host_port, internal_ip) = details
                .map(|d| (d.published_ports.values().next().copied(), d.internal_ip))
                .unwrap_or((None, None));

            rebuilt.insert(
                domain.clone(),
                ManagedContainer {
                    domain,
                    container_id: summary.id,
                    image,
                    status: summary.status,
                    host_port,
                    internal_ip,
                    internal_port: None,
                },
            );
        }

        let count = rebuilt.len();
        *self.containers.lock().await = rebuilt;
        debug!(count, "managed container map rebuilt");
        Ok(())
    }

    /// Deploy any route with no currently managed, running container.
    /// Cancelling `ctx` stops before the next undeployed route is picked up.
    pub async fn auto_start_containers(
        &self,
        ctx: &CancellationToken,
        routes: &[Route],
    ) -> Result<(), CoreError> {
        for route in routes {
            if ctx.is_cancelled() {
                break;
            }
            let exists = self.containers.lock().await.contains_key(&route.domain);
            if !exists {
                self.deploy_container(ctx, route).await?;
            }
        }
        Ok(())
    }

    /// Deploy (or idempotently confirm) the container for `route`. `ctx` is
    /// checked before the (potentially slow) image pull; once the pull has
    /// started the deploy runs to completion rather than leaving a
    /// half-created container behind.
    pub async fn deploy_container(
        &self,
        ctx: &CancellationToken,
        route: &Route,
    ) -> Result<ManagedContainer, CoreError> {
        if let Some(existing) = self.containers.lock().await.get(&route.domain) {
            if existing.image.eq_ignore_ascii_case(&route.image) && !existing.status.is_terminal() {
                debug!(domain = %route.domain, "deploy is a no-op, container already matches");
                return Ok(existing.clone());
            }
        }

        if ctx.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        info!(domain = %route.domain, image = %route.image, "deploying container");

        self.runtime.pull_image(&route.image, None).await?;
        let image_info = self.runtime.inspect_image(&route.image).await?;

        let internal_port = image_info
            .exposed_ports
            .first()
            .and_then(|p| p.split('/').next())
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                CoreError::BadRequest(format!("image {} declares no EXPOSEd port", route.image))
            })?;

        let mut labels = HashMap::new();
        labels.insert("gordon.managed".to_string(), "true".to_string());
        labels.insert("gordon.route".to_string(), route.domain.clone());
        labels.insert("gordon.image".to_string(), route.image.clone());

        let spec = ContainerSpec {
            name: container_name(&route.domain),
            image: route.image.clone(),
            labels,
            // The proxy dials the container over the internal network; no
            // host port is published.
            publish_port: None,
            internal_port: Some(internal_port),
        };

        let container_id = self.runtime.create_container(&spec).await?;
        self.runtime.ensure_network(INTERNAL_NETWORK).await?;
        self.runtime
            .connect_container_to_network(&container_id, INTERNAL_NETWORK)
            .await?;
        self.runtime.start_container(&container_id).await?;

        let details = self.runtime.inspect_container(&container_id).await?;

        let managed = ManagedContainer {
            domain: route.domain.clone(),
            container_id,
            image: route.image.clone(),
            status: details.status,
            host_port: details.published_ports.values().next().copied(),
            internal_ip: details.internal_ip,
            internal_port: Some(internal_port),
        };

        self.containers
            .lock()
            .await
            .insert(route.domain.clone(), managed.clone());

        info!(domain = %route.domain, container_id = %managed.container_id, "container deployed");
        Ok(managed)
    }

    pub async fn stop_container(&self, domain: &str) -> Result<(), CoreError> {
        let container_id = {
            let containers = self.containers.lock().await;
            containers.get(domain).map(|c| c.container_id.clone())
        };
        if let Some(id) = container_id {
            self.runtime.stop_container(&id, STOP_TIMEOUT_SECS).await?;
        }
        Ok(())
    }

    pub async fn remove_container(&self, domain: &str) -> Result<(), CoreError> {
        let container_id = self.containers.lock().await.remove(domain).map(|c| c.container_id);
        if let Some(id) = container_id {
            self.runtime.remove_container(&id, true).await?;
        }
        Ok(())
    }

    /// Stop every managed container sequentially, 30s per container. Errors
    /// are logged and do not abort the remaining stops. `ctx` is the caller's
    /// bounded shutdown context (typically a fresh 30s token); once it's
    /// cancelled, remaining containers are left running for the next sync.
    pub async fn stop_all_managed_containers(&self, ctx: &CancellationToken) {
        let domains: Vec<String> = self.containers.lock().await.keys().cloned().collect();
        for domain in domains {
            if ctx.is_cancelled() {
                warn!("stop-all context cancelled, leaving remaining managed containers running");
                break;
            }
            if let Err(err) = self.stop_container(&domain).await {
                warn!(domain, ?err, "failed to stop managed container during shutdown");
            }
            if let Err(err) = self.remove_container(&domain).await {
                warn!(domain, ?err, "failed to remove managed container during shutdown");
            }
        }
    }

    pub async fn get_container(&self, domain: &str) -> Option<ManagedContainer> {
        self.containers.lock().await.get(domain).cloned()
    }

    pub async fn list_containers(&self) -> Vec<ManagedContainer> {
        self.containers.lock().await.values().cloned().collect()
    }

    /// Upstream address the reverse proxy should dial for `domain`.
    pub async fn get_container_port(&self, domain: &str) -> Option<UpstreamTarget> {
        let containers = self.containers.lock().await;
        let container = containers.get(domain)?;

        if let (Some(ip), Some(port)) = (&container.internal_ip, container.internal_port) {
            return Some(UpstreamTarget::InternalAddr(ip.clone(), port));
        }
        container.host_port.map(UpstreamTarget::HostPort)
    }

    /// Informational status update driven by `container.start`/`container.stop`
    /// events; never alters desired state or triggers a deploy/stop itself.
    pub async fn update_status(&self, domain: &str, status: ContainerStatus) {
        if let Some(container) = self.containers.lock().await.get_mut(domain) {
            debug!(domain, ?status, "container status updated from event");
            container.status = status;
        }
    }

    /// Periodic sweep: containers observed exited/dead are logged and left
    /// for the next reconciliation pass to redeploy. Cancelling `ctx` stops
    /// the sweep before the next container inspect.
    pub async fn health_check(&self, ctx: &CancellationToken) {
        let domains: Vec<(String, String)> = self
            .containers
            .lock()
            .await
            .values()
            .map(|c| (c.domain.clone(), c.container_id.clone()))
            .collect();

        for (domain, container_id) in domains {
            if ctx.is_cancelled() {
                break;
            }
            match self.runtime.inspect_container(&container_id).await {
                Ok(details) => {
                    if details.status.is_terminal() {
                        warn!(domain, status = ?details.status, "managed container is not running");
                    }
                    if let Some(container) = self.containers.lock().await.get_mut(&domain) {
                        container.status = details.status;
                    }
                }
                Err(err) => warn!(domain, ?err, "health check failed to inspect container"),
            }
        }
    }
}

/// `shutdown` is the supervisor's root cancellation context; the loop itself
/// exits as soon as it's cancelled rather than waiting for a ticked sweep to
/// observe it.
pub fn spawn_health_check_task(
    manager: Arc<ContainerManager>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => manager.health_check(&shutdown).await,
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_replaces_dots() {
        assert_eq!(container_name("api.example.com"), "gordon-api-example-com");
    }
}
