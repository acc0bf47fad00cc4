//! Prometheus metrics setup covering the registry, deployment controller,
//! and reverse proxy under a single metric namespace.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use gordon_api::MetricsHandle;

pub fn init_metrics() -> Option<MetricsHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("prometheus metrics enabled at /metrics");

            metrics::describe_counter!(
                "gordon_registry_requests_total",
                "Total OCI Distribution API requests handled"
            );
            metrics::describe_counter!(
                "gordon_event_bus_dropped_total",
                "Events dropped because the publish buffer was full"
            );
            metrics::describe_gauge!(
                "gordon_managed_containers",
                "Number of containers currently managed"
            );
            metrics::describe_histogram!(
                "gordon_proxy_request_duration_seconds",
                "Reverse proxy upstream request duration in seconds"
            );

            Some(handle)
        }
        Err(err) => {
            warn!(%err, "failed to initialize prometheus metrics");
            None
        }
    }
}
