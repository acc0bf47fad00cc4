//! Principal extraction and scope enforcement for the registry's HTTP layer.
//!
//! `auth_middleware` extracts the bearer token from `Authorization`,
//! validates it, and stashes an `AuthPrincipal{scopes}` in request
//! extensions; `require_scope` performs the post-hoc extension check against
//! `Scope::satisfies`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AuthError;
use crate::jwt::JwtManager;
use crate::password::{hash_password, verify_password};
use crate::scope::{Action, Scope};

/// Credentials as presented on the wire, before provider-specific validation.
#[derive(Debug, Clone)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

/// The result of a successful `ValidatePrincipal` call.
#[derive(Debug, Clone)]
pub struct AuthPrincipal {
    pub subject: String,
    pub scopes: Vec<Scope>,
}

impl AuthPrincipal {
    pub fn has_scope(&self, repository: &str, action: Action) -> bool {
        self.scopes.iter().any(|scope| scope.satisfies(repository, action))
    }
}

/// `ValidatePrincipal(credentials) → {subject, scopes[]} | error`.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn validate_principal(&self, credentials: &Credentials) -> Result<AuthPrincipal, AuthError>;
}

/// Validates bearer tokens issued by `JwtManager`; claim scopes that fail to
/// parse as a recognized scope string are dropped rather than rejecting the
/// whole token, so an operator-added custom claim never locks a principal out.
pub struct JwtAuthProvider {
    jwt: Arc<JwtManager>,
}

impl JwtAuthProvider {
    pub fn new(jwt: Arc<JwtManager>) -> Self {
        Self { jwt }
    }
}

#[async_trait]
impl AuthProvider for JwtAuthProvider {
    async fn validate_principal(&self, credentials: &Credentials) -> Result<AuthPrincipal, AuthError> {
        let Credentials::Bearer(token) = credentials else {
            return Err(AuthError::InvalidCredentials);
        };
        let claims = self.jwt.validate_token(token)?;
        let scopes = claims.scopes.iter().filter_map(|s| Scope::parse(s)).collect();
        Ok(AuthPrincipal {
            subject: claims.sub,
            scopes,
        })
    }
}

/// Validates a single shared API key, granting the administrative scope in
/// full. Intended for operator tooling, not per-user access control. The
/// configured key is hashed once at construction and never compared in
/// plaintext, the same provisioning shape a per-user credential store would
/// use.
pub struct ApiKeyAuthProvider {
    api_key_hash: String,
}

impl ApiKeyAuthProvider {
    /// Panics if Argon2 hashing itself fails, which only happens on an
    /// invalid parameter set baked into this crate, never from the
    /// configured key's content.
    pub fn new(api_key: impl Into<String>) -> Self {
        let api_key_hash = hash_password(&api_key.into()).expect("argon2 params are valid");
        Self { api_key_hash }
    }
}

#[async_trait]
impl AuthProvider for ApiKeyAuthProvider {
    async fn validate_principal(&self, credentials: &Credentials) -> Result<AuthPrincipal, AuthError> {
        let Credentials::Bearer(token) = credentials else {
            return Err(AuthError::InvalidCredentials);
        };
        match verify_password(token, &self.api_key_hash) {
            Ok(true) => Ok(AuthPrincipal {
                subject: "api-key".to_string(),
                scopes: vec![Scope::admin()],
            }),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}

/// Shared auth configuration injected into axum state. `provider` is `None`
/// when `[auth].enabled = false`, in which case every request proceeds
/// without a principal and `require_scope` never denies.
pub struct AuthState {
    pub provider: Option<Arc<dyn AuthProvider>>,
    pub anonymous_pull: bool,
}

fn extract_bearer_token(header: &str) -> Result<&str, AuthError> {
    header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidAuthHeader)
}

/// Extracts and validates the `Authorization` header, if present, stashing
/// the resulting `AuthPrincipal` in request extensions for handlers to read.
/// An absent header is not itself an error; `require_scope` is what turns a
/// missing principal into a denial for operations that need one.
pub async fn auth_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(provider) = &state.provider else {
        return Ok(next.run(request).await);
    };

    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        let token = extract_bearer_token(header)?;
        let principal = provider
            .validate_principal(&Credentials::Bearer(token.to_string()))
            .await?;
        request.extensions_mut().insert(principal);
    }

    Ok(next.run(request).await)
}

/// The registry's single authorization policy: anonymous pulls are
/// configurable; every write requires a principal holding `push` (or
/// `admin:*:*`) scope for the target repository.
pub fn require_scope(
    principal: Option<&AuthPrincipal>,
    anonymous_pull: bool,
    repository: &str,
    action: Action,
) -> Result<(), AuthError> {
    if action == Action::Pull && anonymous_pull && principal.is_none() {
        return Ok(());
    }

    let principal = principal.ok_or(AuthError::MissingAuthHeader)?;
    if principal.has_scope(repository, action) {
        Ok(())
    } else {
        Err(AuthError::ScopeDenied {
            scope: format!("repository:{repository}:{action}"),
            repository: repository.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jwt_provider_accepts_valid_token_and_drops_unparseable_scopes() {
        let jwt = Arc::new(JwtManager::new("secret", 3600));
        let token = jwt
            .generate_token("ci", &["repository:app:push".to_string(), "garbage".to_string()])
            .unwrap();

        let provider = JwtAuthProvider::new(jwt);
        let principal = provider
            .validate_principal(&Credentials::Bearer(token))
            .await
            .unwrap();

        assert_eq!(principal.subject, "ci");
        assert_eq!(principal.scopes.len(), 1);
    }

    #[tokio::test]
    async fn api_key_provider_grants_admin_scope() {
        let provider = ApiKeyAuthProvider::new("topsecret");
        let principal = provider
            .validate_principal(&Credentials::Bearer("topsecret".to_string()))
            .await
            .unwrap();
        assert!(principal.has_scope("anything", Action::Push));
    }

    #[test]
    fn anonymous_pull_allowed_without_principal() {
        require_scope(None, true, "app", Action::Pull).unwrap();
    }

    #[test]
    fn write_without_principal_is_denied() {
        let err = require_scope(None, true, "app", Action::Push).unwrap_err();
        assert!(matches!(err, AuthError::MissingAuthHeader));
    }

    #[test]
    fn mismatched_repository_scope_is_denied() {
        let principal = AuthPrincipal {
            subject: "ci".to_string(),
            scopes: vec![Scope::repository("other", Action::Push)],
        };
        let err = require_scope(Some(&principal), false, "app", Action::Push).unwrap_err();
        assert!(matches!(err, AuthError::ScopeDenied { .. }));
    }
}
