//! Keeps the reverse proxy's routing table in sync with the Container
//! Manager's view of the world.
//!
//! `gordon_proxy::RouteResolver::resolve` is synchronous by design (it backs
//! the proxy's hot path with a lock-free `ArcSwap` read); `ContainerManager`'s
//! queries are `async` (they await a `tokio::sync::Mutex`). Rather than make
//! the resolver async and put a mutex wait on every proxied request, this
//! handler rebuilds the whole table from `list_containers()` and pushes it
//! into the `TableResolver` whenever something that can change routing fires
//! on the event bus: `ContainerStart`/`ContainerStop` (from the runtime) and
//! `ConfigReload`/`ManualReload` (from `DeploymentController::reconcile`).
//!
//! Same shape as `spawn_health_check_task`: a handle-owning task driven by
//! one cheap condition, here the event bus's dispatch rather than a timer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use gordon_core::{ContainerManager, CoreError, Event, EventType, Handler, UpstreamTarget};
use gordon_proxy::{RoutingTable, TableResolver, Upstream};

pub struct RouteSyncHandler {
    container_manager: Arc<ContainerManager>,
    resolver: Arc<TableResolver>,
}

impl RouteSyncHandler {
    pub fn new(container_manager: Arc<ContainerManager>, resolver: Arc<TableResolver>) -> Self {
        Self {
            container_manager,
            resolver,
        }
    }

    pub async fn refresh(&self) {
        let containers = self.container_manager.list_containers().await;
        let mut routes = HashMap::with_capacity(containers.len());

        for container in containers {
            let Some(target) = self
                .container_manager
                .get_container_port(&container.domain)
                .await
            else {
                continue;
            };

            let upstream = match target {
                UpstreamTarget::HostPort(port) => Upstream::HostPort(port),
                UpstreamTarget::InternalAddr(addr, port) => Upstream::InternalAddr(addr, port),
            };
            routes.insert(container.domain, upstream);
        }

        let count = routes.len();
        self.resolver.update(RoutingTable::new(routes));
        debug!(routes = count, "routing table refreshed");
    }
}

#[async_trait]
impl Handler for RouteSyncHandler {
    fn can_handle(&self, event_type: EventType) -> bool {
        matches!(
            event_type,
            EventType::ContainerStart
                | EventType::ContainerStop
                | EventType::ConfigReload
                | EventType::ManualReload
                | EventType::ImagePushed
        )
    }

    async fn handle(&self, _event: &Event) -> Result<(), CoreError> {
        self.refresh().await;
        Ok(())
    }

    fn name(&self) -> &str {
        "route-sync"
    }
}
