//! Authentication error types
//!
//! `IntoResponse` maps each variant to a JSON error body, including the
//! scope-denial case (`ScopeDenied`) the registry's authorization policy
//! needs in place of a role check.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("missing authorization header")]
    MissingAuthHeader,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("scope {scope} denied for repository {repository}")]
    ScopeDenied { scope: String, repository: String },

    #[error("password hashing error: {0}")]
    PasswordHash(String),

    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AuthError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string())
            }
            AuthError::InvalidToken | AuthError::TokenExpired | AuthError::Jwt(_) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string())
            }
            AuthError::MissingAuthHeader | AuthError::InvalidAuthHeader => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string())
            }
            AuthError::ScopeDenied { .. } => (StatusCode::FORBIDDEN, "DENIED", self.to_string()),
            AuthError::PasswordHash(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "internal error".to_string(),
            ),
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
