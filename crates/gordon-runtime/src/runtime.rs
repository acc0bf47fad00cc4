//! The `ContainerRuntime` abstraction: everything the Deployment Controller and
//! Container Manager need from a container daemon, without naming Docker directly.

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::types::{
    ContainerDetails, ContainerSpec, ContainerSummary, ImageInfo, PruneResult,
    RegistryCredentials,
};

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<(), RuntimeError>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, RuntimeError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    async fn connect_container_to_network(
        &self,
        id: &str,
        network: &str,
    ) -> Result<(), RuntimeError>;

    async fn prune_images(&self, dangling_only: bool) -> Result<PruneResult, RuntimeError>;
}
