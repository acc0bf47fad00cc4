//! Reverse proxy: routes inbound HTTP requests by `Host` header to the
//! managed container responsible for that domain and forwards them
//! unmodified.

pub mod error;
pub mod forward;
pub mod routing;

pub use error::ProxyError;
pub use forward::{proxy_handler, ReverseProxy};
pub use routing::{normalize_host, RouteResolver, RoutingTable, TableResolver, Upstream};
