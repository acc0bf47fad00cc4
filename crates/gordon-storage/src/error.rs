//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("size mismatch: declared {declared}, wrote {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("path would escape storage root")]
    PathEscapesRoot,

    #[error("unknown upload session: {0}")]
    UnknownSession(String),
}
