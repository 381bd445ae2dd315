//! Per-worker request router for a memcache-protocol proxy.
//!
//! A worker ([`worker::Proxy`]) owns one event loop, admits parsed memcache
//! requests from transport threads, routes each through an immutable route
//! handle tree to backend clients, and delivers exactly one reply per
//! request. Routing configuration is hot-swapped without dropping in-flight
//! traffic.

pub mod config;
pub mod observability;
pub mod pool;
pub mod routing;
pub mod runtime_vars;
pub mod stats;
pub mod worker;

pub use config::reloader::Router;
pub use config::schema::RouterOptions;
pub use worker::proxy::Proxy;
pub use worker::request::{McMsg, McOp, McResult, Reply};
