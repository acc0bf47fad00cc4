//! Translates Event Bus activity into Container Manager actions: the
//! reconciliation loop that converges running containers toward the
//! configured route set.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gordon_runtime::ContainerStatus;

use crate::container_manager::{ContainerManager, Route};
use crate::error::CoreError;
use crate::event::{Event, EventBus, EventPayload, EventType, Handler};
use crate::gc::GarbageCollector;

pub struct DeploymentController {
    container_manager: Arc<ContainerManager>,
    gc: Arc<GarbageCollector>,
    event_bus: EventBus,
    routes: RwLock<Vec<Route>>,
    auto_route_enabled: bool,
    registry_domain: Option<String>,
    /// Cancellation context propagated into every Container Manager call
    /// this controller makes; cancelled once by the supervisor at shutdown
    /// so an in-flight reconciliation winds down instead of racing the
    /// stop-all sweep.
    shutdown: CancellationToken,
}

impl DeploymentController {
    pub fn new(
        container_manager: Arc<ContainerManager>,
        gc: Arc<GarbageCollector>,
        event_bus: EventBus,
        auto_route_enabled: bool,
        registry_domain: Option<String>,
    ) -> Self {
        Self {
            container_manager,
            gc,
            event_bus,
            routes: RwLock::new(Vec::new()),
            auto_route_enabled,
            registry_domain,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn set_routes(&self, routes: Vec<Route>) {
        *self.routes.write() = routes;
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().clone()
    }

    /// Cancel this controller's context. Called once by the supervisor
    /// during shutdown, before `StopAllManagedContainers` runs.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Diff the desired route set against observed managed containers and
    /// converge: deploy missing, redeploy mismatched, leave matching ones
    /// alone, stop/remove anything no longer in the config.
    pub async fn reconcile(&self) -> Result<(), CoreError> {
        info!("running reconciliation");
        self.container_manager.sync_containers(&self.shutdown).await?;

        let routes = self.routes();
        for route in &routes {
            match self.container_manager.get_container(&route.domain).await {
                None => {
                    self.container_manager.deploy_container(&self.shutdown, route).await?;
                }
                Some(existing) if !existing.image.eq_ignore_ascii_case(&route.image) => {
                    self.container_manager.stop_container(&route.domain).await?;
                    self.container_manager.remove_container(&route.domain).await?;
                    self.container_manager.deploy_container(&self.shutdown, route).await?;
                }
                Some(_) => {
                    // Image matches; leave in place.
                }
            }
        }

        let desired_domains: std::collections::HashSet<&str> =
            routes.iter().map(|r| r.domain.as_str()).collect();

        for managed in self.container_manager.list_containers().await {
            if !desired_domains.contains(managed.domain.as_str()) {
                info!(domain = %managed.domain, "route removed from config, tearing down container");
                self.container_manager.stop_container(&managed.domain).await?;
                self.container_manager.remove_container(&managed.domain).await?;
            }
        }

        Ok(())
    }

    async fn handle_image_pushed(
        &self,
        name: &str,
        reference: &str,
    ) -> Result<(), CoreError> {
        let full = format!("{name}:{reference}");

        let matching: Vec<Route> = self
            .routes()
            .into_iter()
            .filter(|r| r.image.eq_ignore_ascii_case(&full))
            .collect();

        for route in &matching {
            self.container_manager.deploy_container(&self.shutdown, route).await?;
        }

        if self.auto_route_enabled && !self.routes().iter().any(|r| r.domain == name) {
            if is_auto_routable_domain(name) {
                let image = match &self.registry_domain {
                    Some(domain) => format!("{domain}/{full}"),
                    None => full.clone(),
                };
                info!(domain = name, image = %image, "auto-routing newly pushed image");
                let mut routes = self.routes();
                routes.push(Route {
                    domain: name.to_string(),
                    image,
                });
                self.set_routes(routes);

                if let Err(err) = self.event_bus.publish(EventPayload::ConfigReload).await {
                    warn!(?err, "failed to publish config.reload after auto-route");
                }
            } else {
                info!(name, "skipped auto-route: name does not look like a domain");
            }
        }

        Ok(())
    }
}

/// Conservative auto-route heuristic: reject any name whose first
/// `/`-delimited path segment contains no dot (the common shape of
/// `registry-host/org/image` non-domain names), accepting bare names like
/// `api.example.com` that contain a dot and no path separator. An IPv4 or
/// IPv6 literal also contains dots (or colons) but is not a domain, so it is
/// rejected even though the dot check alone would pass it.
fn is_auto_routable_domain(name: &str) -> bool {
    let first_segment = name.split('/').next().unwrap_or(name);
    first_segment.contains('.') && first_segment.parse::<IpAddr>().is_err()
}

#[async_trait]
impl Handler for DeploymentController {
    fn can_handle(&self, event_type: EventType) -> bool {
        matches!(
            event_type,
            EventType::ImagePushed
                | EventType::ConfigReload
                | EventType::ManualReload
                | EventType::ContainerStart
                | EventType::ContainerStop
        )
    }

    async fn handle(&self, event: &Event) -> Result<(), CoreError> {
        match &event.payload {
            EventPayload::ImagePushed { name, reference, .. } => {
                self.handle_image_pushed(name, reference).await
            }
            EventPayload::ConfigReload => self.reconcile().await,
            EventPayload::ManualReload => {
                self.reconcile().await?;
                match self.gc.run().await {
                    Ok(report) => {
                        info!(?report, "manual reload triggered gc pass");
                        Ok(())
                    }
                    Err(err) => {
                        warn!(?err, "gc pass during manual reload failed");
                        Ok(())
                    }
                }
            }
            EventPayload::ContainerStart { route } => {
                self.container_manager
                    .update_status(route, ContainerStatus::Running)
                    .await;
                Ok(())
            }
            EventPayload::ContainerStop { route } => {
                self.container_manager
                    .update_status(route, ContainerStatus::Exited)
                    .await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "deployment-controller"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_registry_style_names() {
        assert!(!is_auto_routable_domain("registry-host/org/image"));
        assert!(!is_auto_routable_domain("library/alpine"));
    }

    #[test]
    fn accepts_bare_domain_names() {
        assert!(is_auto_routable_domain("api.example.com"));
        assert!(is_auto_routable_domain("my-app.internal"));
    }

    #[test]
    fn rejects_ip_literals() {
        assert!(!is_auto_routable_domain("10.0.0.1"));
        assert!(!is_auto_routable_domain("127.0.0.1/org/image"));
        assert!(!is_auto_routable_domain("::1"));
    }
}
