//! Container runtime error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("docker engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("image {0} declares no EXPOSEd port")]
    NoExposedPort(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out waiting for {operation} on {id}")]
    Timeout { operation: &'static str, id: String },
}
