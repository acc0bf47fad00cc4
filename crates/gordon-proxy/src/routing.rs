//! The proxy's routing table: a `Host` header lookup backed by `arc-swap`
//! for lock-free reads on the request hot path and atomic whole-table swaps
//! on reload.
//!
//! Resolution is delegated through the `RouteResolver` trait rather than a
//! shared reference to the Container Manager: Container Manager and
//! Reverse Proxy would otherwise need a cyclic dependency (the controller
//! updates routes the proxy reads, the proxy needs live container
//! addresses the controller tracks). The proxy only
//! knows how to ask "where does this host go", never how that answer is
//! produced.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Where a resolved request should be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// A container published on a host port (bridge networking fallback).
    HostPort(u16),
    /// A container reachable directly on the `gordon-internal` network.
    InternalAddr(String, u16),
}

impl Upstream {
    pub fn base_url(&self) -> String {
        match self {
            Upstream::HostPort(port) => format!("http://127.0.0.1:{port}"),
            Upstream::InternalAddr(addr, port) => format!("http://{addr}:{port}"),
        }
    }
}

/// A snapshot of `domain -> upstream`, swapped in atomically on reload.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Upstream>,
}

impl RoutingTable {
    pub fn new(routes: HashMap<String, Upstream>) -> Self {
        Self { routes }
    }

    pub fn lookup(&self, domain: &str) -> Option<&Upstream> {
        self.routes.get(domain)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Resolves a `Host` header to an upstream target at request time. An
/// implementation typically wraps a live `ContainerManager` lookup;
/// `StaticResolver` below is provided for direct config-file routing
/// and for tests.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, domain: &str) -> Option<Upstream>;
}

/// A `RouteResolver` over a fixed, swappable table. Useful standalone for
/// deployments with no Container Manager in the loop, and as the seam
/// `gordon-api` wires a live container-backed resolver into.
pub struct TableResolver {
    table: ArcSwap<RoutingTable>,
}

impl TableResolver {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    pub fn update(&self, table: RoutingTable) {
        self.table.store(Arc::new(table));
    }

    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }
}

impl RouteResolver for TableResolver {
    fn resolve(&self, domain: &str) -> Option<Upstream> {
        self.table.load().lookup(domain).cloned()
    }
}

/// Strips a trailing `:port` and lower-cases a `Host` header value so
/// `App.Example.com:443` and `app.example.com` route identically.
pub fn normalize_host(host: &str) -> String {
    let without_port = host.split(':').next().unwrap_or(host);
    without_port.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_strips_port() {
        assert_eq!(normalize_host("App.Example.com:8080"), "app.example.com");
        assert_eq!(normalize_host("app.example.com"), "app.example.com");
    }

    #[test]
    fn resolver_reflects_latest_swapped_table() {
        let mut routes = HashMap::new();
        routes.insert("app.example.com".to_string(), Upstream::HostPort(8080));
        let resolver = TableResolver::new(RoutingTable::new(routes));

        assert_eq!(
            resolver.resolve("app.example.com"),
            Some(Upstream::HostPort(8080))
        );
        assert_eq!(resolver.resolve("missing.example.com"), None);

        let mut updated = HashMap::new();
        updated.insert(
            "app.example.com".to_string(),
            Upstream::InternalAddr("10.0.0.5".to_string(), 80),
        );
        resolver.update(RoutingTable::new(updated));

        assert_eq!(
            resolver.resolve("app.example.com"),
            Some(Upstream::InternalAddr("10.0.0.5".to_string(), 80))
        );
    }
}
