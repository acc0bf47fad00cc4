//! Runtime-agnostic types shared by the `ContainerRuntime` trait and its adapters.

use std::collections::HashMap;

/// Credentials for pulling from a private registry.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Result of inspecting an image prior to deployment.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    /// Container-internal ports declared via `EXPOSE`, e.g. `8080/tcp`.
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub env: Vec<String>,
}

/// Desired state for a new managed container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// `Some(host_port)` publishes the container's first exposed TCP port on
    /// that host port; `None` leaves it reachable only on the internal network.
    pub publish_port: Option<u16>,
    pub internal_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn from_docker_state(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }
}

/// Summary row from a container listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
}

/// Detailed inspection result for a single container.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub status: ContainerStatus,
    /// Map of container-internal port to host-published port, e.g. `8080/tcp -> 32768`.
    pub published_ports: HashMap<String, u16>,
    /// IP address on the Gordon-managed internal network, if connected.
    pub internal_ip: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PruneResult {
    pub deleted: Vec<String>,
    pub reclaimed_bytes: u64,
}
