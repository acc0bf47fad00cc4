//! API error types.
//!
//! `ApiError` maps onto the OCI error document, with the full registry
//! error-code set (`BLOB_UNKNOWN`, `MANIFEST_UNKNOWN`, `NAME_INVALID`, …)
//! rather than a generic `NOT_FOUND`/`BAD_REQUEST`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use gordon_core::CoreError;
use gordon_storage::StorageError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("auth error: {0}")]
    Auth(#[from] gordon_auth::AuthError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NAME_UNKNOWN", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Unsupported(msg) => {
                (StatusCode::BAD_REQUEST, "UNSUPPORTED", msg.clone())
            }
            ApiError::Core(err) => map_core_error(err),
            ApiError::Storage(err) => map_storage_error(err),
            ApiError::Auth(err) => map_auth_error(err),
        };

        let body = axum::Json(json!({
            "errors": [{
                "code": code,
                "message": message,
                "detail": null
            }]
        }));

        (status, body).into_response()
    }
}

fn map_core_error(err: &CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::NotFound(msg) => (StatusCode::NOT_FOUND, "NAME_UNKNOWN", msg.clone()),
        CoreError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "MANIFEST_INVALID", msg.clone()),
        CoreError::Storage(storage_err) => map_storage_error(storage_err),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            err.to_string(),
        ),
    }
}

fn map_storage_error(err: &StorageError) -> (StatusCode, &'static str, String) {
    match err {
        StorageError::NotFound(msg) => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN", msg.clone()),
        StorageError::InvalidDigest(msg) => {
            (StatusCode::BAD_REQUEST, "DIGEST_INVALID", msg.clone())
        }
        StorageError::InvalidName(msg) => (StatusCode::BAD_REQUEST, "NAME_INVALID", msg.clone()),
        StorageError::DigestMismatch { expected, actual } => (
            StatusCode::BAD_REQUEST,
            "DIGEST_INVALID",
            format!("expected digest {expected}, computed {actual}"),
        ),
        StorageError::SizeMismatch { declared, actual } => (
            StatusCode::BAD_REQUEST,
            "SIZE_INVALID",
            format!("declared size {declared}, wrote {actual}"),
        ),
        StorageError::UnknownSession(id) => {
            (StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", id.clone())
        }
        StorageError::PathEscapesRoot => (
            StatusCode::BAD_REQUEST,
            "NAME_INVALID",
            "path escapes storage root".to_string(),
        ),
        StorageError::Io(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            e.to_string(),
        ),
    }
}

fn map_auth_error(err: &gordon_auth::AuthError) -> (StatusCode, &'static str, String) {
    use gordon_auth::AuthError;
    match err {
        AuthError::ScopeDenied { .. } => (StatusCode::FORBIDDEN, "DENIED", err.to_string()),
        _ => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", err.to_string()),
    }
}
