//! Request forwarding: turns an inbound `Host`-routed request into an
//! outbound call against the resolved upstream and streams the response
//! back unmodified.
//!
//! A single shared `reqwest::Client` handles outbound requests; there is no
//! upstream-credential plumbing (no `authenticate`, no 401-retry loop) since
//! the proxy forwards byte for byte and never holds or injects credentials
//! on a container's behalf.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, Method, Uri};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::routing::{normalize_host, RouteResolver};

/// Headers that are meaningful only for a single hop and must not be
/// blindly forwarded, per RFC 7230 section 6.1.
const HOP_BY_HOP: &[&str] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
]
.as_slice();

pub struct ReverseProxy {
    resolver: Arc<dyn RouteResolver>,
    client: reqwest::Client,
    in_flight: AtomicUsize,
}

impl ReverseProxy {
    pub fn new(resolver: Arc<dyn RouteResolver>) -> Self {
        Self {
            resolver,
            client: reqwest::Client::new(),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for in-flight requests to drain, up to `timeout`, for a
    /// graceful shutdown. Returns `true` if fully drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.in_flight_count(),
                    "proxy drain timed out with requests still in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    async fn forward(&self, request: axum::extract::Request) -> Result<Response, ProxyError> {
        let host = request
            .headers()
            .get(axum::http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(normalize_host)
            .ok_or_else(|| ProxyError::NoRoute("missing host header".to_string()))?;

        let upstream = self
            .resolver
            .resolve(&host)
            .ok_or_else(|| ProxyError::NoRoute(host.clone()))?;

        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", upstream.base_url(), path_and_query);

        debug!(%host, %url, method = %parts.method, "forwarding request");

        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|err| ProxyError::InvalidResponse(err.to_string()))?;

        let mut outbound = self.client.request(parts.method.clone(), &url);
        outbound = outbound.headers(forwardable_headers(&parts.headers, &parts.uri));
        outbound = outbound.body(body_bytes);

        let response = outbound.send().await?;
        let status = response.status();
        let response_headers = forwardable_headers(response.headers(), &parts.uri);
        let body_bytes = response.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            builder = builder.header(name, value);
        }

        builder
            .body(Body::from(body_bytes))
            .map_err(|err| ProxyError::InvalidResponse(err.to_string()))
    }
}

fn forwardable_headers(headers: &HeaderMap, _uri: &Uri) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Axum handler wiring for any method/path: `.fallback(proxy_handler)`.
pub async fn proxy_handler(
    State(proxy): State<Arc<ReverseProxy>>,
    request: axum::extract::Request,
) -> Response {
    proxy.in_flight.fetch_add(1, Ordering::SeqCst);
    let result = proxy.forward(request).await;
    proxy.in_flight.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{RoutingTable, TableResolver, Upstream};
    use std::collections::HashMap;

    fn resolver_with(domain: &str, upstream: Upstream) -> Arc<dyn RouteResolver> {
        let mut routes = HashMap::new();
        routes.insert(domain.to_string(), upstream);
        Arc::new(TableResolver::new(RoutingTable::new(routes)))
    }

    #[tokio::test]
    async fn unmatched_host_yields_no_route_error() {
        let proxy = ReverseProxy::new(resolver_with(
            "known.example.com",
            Upstream::HostPort(9000),
        ));
        let request = axum::extract::Request::builder()
            .method(Method::GET)
            .uri("/")
            .header("host", "unknown.example.com")
            .body(Body::empty())
            .unwrap();

        let err = proxy.forward(request).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoRoute(_)));
    }

    #[tokio::test]
    async fn missing_host_header_is_rejected() {
        let proxy = ReverseProxy::new(resolver_with(
            "known.example.com",
            Upstream::HostPort(9000),
        ));
        let request = axum::extract::Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let err = proxy.forward(request).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoRoute(_)));
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_idle() {
        let proxy = ReverseProxy::new(resolver_with("x", Upstream::HostPort(1)));
        assert!(proxy.drain(Duration::from_millis(100)).await);
    }

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }
}
