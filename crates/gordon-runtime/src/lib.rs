//! Abstract container runtime consumed by the Deployment Controller and
//! Container Manager, plus a concrete adapter talking to the local Docker
//! Engine API.

pub mod bollard_adapter;
pub mod error;
pub mod runtime;
pub mod types;

pub use bollard_adapter::BollardRuntime;
pub use error::RuntimeError;
pub use runtime::ContainerRuntime;
pub use types::{
    ContainerDetails, ContainerSpec, ContainerStatus, ContainerSummary, ImageInfo, PruneResult,
    RegistryCredentials,
};
