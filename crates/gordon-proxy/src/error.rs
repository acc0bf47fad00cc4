//! Reverse proxy error types.
//!
//! There are no credential-specific variants (`Unauthorized`,
//! `TokenRefreshFailed`): the proxy forwards requests without ever handling
//! upstream credentials. `NoRoute` covers an unmatched `Host` header.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no route for host: {0}")]
    NoRoute(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream returned error: {status} - {message}")]
    UpstreamError { status: u16, message: String },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::NoRoute(_) => StatusCode::NOT_FOUND,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}
