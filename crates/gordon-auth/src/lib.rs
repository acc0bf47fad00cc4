//! Principal authentication and scope-based authorization for the registry
//! and its management surface, via a `ValidatePrincipal`/`RequireScope`
//! adapter interface.

pub mod error;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod scope;

pub use error::AuthError;
pub use jwt::{Claims, JwtManager};
pub use middleware::{
    auth_middleware, require_scope, ApiKeyAuthProvider, AuthPrincipal, AuthProvider, AuthState,
    Credentials, JwtAuthProvider,
};
pub use password::{hash_password, verify_password};
pub use scope::{Action, Scope};
