//! HTTP router assembly.
//!
//! A single `gordon_auth::auth_middleware` layer is applied across the whole
//! router; `create_router` takes an optional metrics handle so the
//! `/metrics` route can be omitted when no recorder was installed.

mod health;
mod metrics;
mod registry;

use std::sync::Arc;

use axum::Router;

use crate::state::{AppState, MetricsHandle};

pub fn create_router(state: AppState, metrics_handle: Option<Arc<MetricsHandle>>) -> Router {
    let auth_state = state.auth.clone();

    let mut router = Router::new()
        .merge(health::routes())
        .merge(registry::routes())
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            gordon_auth::auth_middleware,
        ))
        .with_state(state);

    if let Some(handle) = metrics_handle {
        router = router.merge(metrics::routes(handle));
    }

    router
}
