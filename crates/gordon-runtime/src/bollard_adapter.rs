//! `ContainerRuntime` adapter backed by the local Docker Engine API via `bollard`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, PruneImagesOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::runtime::ContainerRuntime;
use crate::types::{
    ContainerDetails, ContainerSpec, ContainerStatus, ContainerSummary, ImageInfo, PruneResult,
    RegistryCredentials,
};

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    /// Connect to the local Docker daemon over its default transport (Unix
    /// socket on Linux/macOS, named pipe on Windows).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    #[cfg(test)]
    pub(crate) fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<(), RuntimeError> {
        let (image, tag) = split_reference(reference);
        debug!(image, tag, "pulling image");

        let options = CreateImageOptions {
            from_image: image,
            tag,
            ..Default::default()
        };

        let docker_creds = credentials.map(|c| bollard::auth::DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, docker_creds);
        while let Some(progress) = stream.next().await {
            if let Err(err) = progress {
                return Err(RuntimeError::Docker(err));
            }
        }

        info!(reference, "image pulled");
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, RuntimeError> {
        let inspect = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|err| map_not_found(err, || RuntimeError::ImageNotFound(reference.to_string())))?;

        let config = inspect.config.unwrap_or_default();

        let exposed_ports = config
            .exposed_ports
            .unwrap_or_default()
            .into_keys()
            .collect();
        let volumes = config.volumes.unwrap_or_default().into_keys().collect();
        let env = config.env.unwrap_or_default();

        Ok(ImageInfo {
            exposed_ports,
            volumes,
            env,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

        if let Some(internal) = spec.internal_port {
            let key = format!("{internal}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());

            if let Some(host_port) = spec.publish_port {
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(host_port.to_string()),
                    }]),
                );
            }
        }

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await?;

        for warning in &response.warnings {
            warn!(container = %spec.name, %warning, "docker warning during container creation");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|err| map_not_found(err, || RuntimeError::ContainerNotFound(id.to_string())))
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped is not an error condition for our purposes.
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(err) => Err(map_not_found(err, || RuntimeError::ContainerNotFound(id.to_string()))),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(err) => Err(RuntimeError::Docker(err)),
        }
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec!["gordon.managed=true".to_string()]);

        let options = ListContainersOptions {
            all,
            filters,
            ..Default::default()
        };

        let summaries = self.docker.list_containers(Some(options)).await?;

        Ok(summaries
            .into_iter()
            .map(|s| ContainerSummary {
                id: s.id.unwrap_or_default(),
                names: s.names.unwrap_or_default(),
                image: s.image.unwrap_or_default(),
                status: ContainerStatus::from_docker_state(s.state.as_deref().unwrap_or("unknown")),
                labels: s.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|err| map_not_found(err, || RuntimeError::ContainerNotFound(id.to_string())))?;

        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| ContainerStatus::from_docker_state(&s.to_string()))
            .unwrap_or(ContainerStatus::Unknown("unknown".to_string()));

        let network_settings = inspect.network_settings.unwrap_or_default();

        let mut published_ports = HashMap::new();
        for (container_port, bindings) in network_settings.ports.unwrap_or_default() {
            if let Some(bindings) = bindings {
                if let Some(first) = bindings.into_iter().next() {
                    if let Some(host_port) = first.host_port.and_then(|p| p.parse::<u16>().ok()) {
                        published_ports.insert(container_port, host_port);
                    }
                }
            }
        }

        let internal_ip = network_settings
            .networks
            .unwrap_or_default()
            .get("gordon-internal")
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        let labels = inspect
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            status,
            published_ports,
            internal_ip,
            labels,
        })
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        match self.docker.inspect_network::<String>(name, None).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(network = name, "creating managed network");
                self.docker
                    .create_network(CreateNetworkOptions {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|err| RuntimeError::Network(err.to_string()))?;
                Ok(())
            }
            Err(err) => Err(RuntimeError::Network(err.to_string())),
        }
    }

    async fn connect_container_to_network(
        &self,
        id: &str,
        network: &str,
    ) -> Result<(), RuntimeError> {
        match self
            .docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: id.to_string(),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already connected is idempotent from Gordon's perspective.
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 403, .. }) => Ok(()),
            Err(err) => Err(RuntimeError::Network(err.to_string())),
        }
    }

    async fn prune_images(&self, dangling_only: bool) -> Result<PruneResult, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec![dangling_only.to_string()]);

        let response = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await?;

        let deleted = response
            .images_deleted
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| item.deleted.or(item.untagged))
            .collect();

        Ok(PruneResult {
            deleted,
            reclaimed_bytes: response.space_reclaimed.unwrap_or(0) as u64,
        })
    }
}

fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        // Guard against mistaking a digest or a registry host:port for a tag separator.
        Some((image, tag)) if !tag.contains('/') && !tag.is_empty() => {
            (image.to_string(), tag.to_string())
        }
        _ => (reference.to_string(), "latest".to_string()),
    }
}

fn map_not_found(
    err: bollard::errors::Error,
    not_found: impl FnOnce() -> RuntimeError,
) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => not_found(),
        other => RuntimeError::Docker(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reference_handles_tag() {
        assert_eq!(
            split_reference("library/alpine:3.19"),
            ("library/alpine".to_string(), "3.19".to_string())
        );
    }

    #[test]
    fn split_reference_defaults_to_latest() {
        assert_eq!(
            split_reference("library/alpine"),
            ("library/alpine".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn split_reference_ignores_registry_port() {
        assert_eq!(
            split_reference("registry.example.com:5000/app"),
            ("registry.example.com:5000/app".to_string(), "latest".to_string())
        );
    }
}
