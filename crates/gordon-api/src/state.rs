//! Application state shared across HTTP handlers.
//!
//! `AppState` wraps a single origin-only `RegistryService` (gordon-core owns
//! no cache; Gordon is the origin registry) and an `AuthState` in place of a
//! bare `JwtManager` + `auth_enabled` bool pair, since the auth method is
//! configurable between `jwt` and `api_key`.

use std::sync::Arc;

use gordon_auth::AuthState;
use gordon_core::RegistryService;

/// Type alias for the Prometheus metrics handle.
pub type MetricsHandle = metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RegistryService>,
    pub auth: Arc<AuthState>,
}

impl AppState {
    pub fn new(registry: Arc<RegistryService>, auth: Arc<AuthState>) -> Self {
        Self { registry, auth }
    }
}
