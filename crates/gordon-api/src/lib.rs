//! Gordon's HTTP surface: the OCI Distribution v2 registry API, health
//! checks, and Prometheus metrics.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
