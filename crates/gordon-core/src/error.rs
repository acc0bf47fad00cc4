//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("storage error: {0}")]
    Storage(#[from] gordon_storage::StorageError),

    #[error("runtime error: {0}")]
    Runtime(#[from] gordon_runtime::RuntimeError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("event bus is stopped")]
    BusStopped,

    #[error("event bus buffer is full")]
    BufferFull,

    #[error("event bus did not stop within its deadline")]
    StopTimeout,

    #[error("operation cancelled")]
    Cancelled,
}
