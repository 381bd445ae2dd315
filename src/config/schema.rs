//! Configuration schema definitions.
//!
//! This module defines the startup options for a router instance and the
//! shape of the dynamic routing config blob. All types derive Serde traits
//! for deserialization from JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pool::client::{Protocol, Transport};

/// Startup options shared by every worker of a router instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterOptions {
    /// Number of workers to run.
    pub num_proxies: usize,

    /// Default routing prefix, of the form `/region/cluster/`.
    pub default_route: String,

    /// Maximum requests a worker processes concurrently. 0 disables the
    /// admission gate entirely.
    pub proxy_max_inflight_requests: usize,

    /// Synchronous reply mode: the reply is enqueued only once all work
    /// referencing the request context has settled.
    pub sync: bool,

    /// Consecutive send failures before a backend is marked TKO. 0 disables
    /// TKO tracking.
    pub failures_until_tko: u32,

    /// Reclaim backend connections idle for longer than this. 0 disables
    /// the reset timer.
    pub reset_inactive_connection_interval_ms: u64,

    /// Cadence of the worker's housekeeping tick (RTT gauge flush, client
    /// sweep, inactivity reset).
    pub housekeeping_interval_ms: u64,

    /// Smoothing factor for round-trip-time accounting, in [0, 1].
    pub rtt_smoothing_factor: f64,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            num_proxies: 1,
            default_route: "/default/default/".to_string(),
            proxy_max_inflight_requests: 1024,
            sync: false,
            failures_until_tko: 3,
            reset_inactive_connection_interval_ms: 0,
            housekeeping_interval_ms: 1_000,
            rtt_smoothing_factor: 1.0 / 16.0,
        }
    }
}

/// The dynamic routing configuration: pools, migrations, and the prefix
/// route map. This is what hot reloads replace.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    /// Backend pools by name.
    pub pools: HashMap<String, PoolConfig>,

    /// Migrated pools by name. These describe an ongoing migration between
    /// two pools defined in `pools`.
    pub migrated_pools: HashMap<String, MigratedPoolConfig>,

    /// Routing prefix (`/region/cluster/`) to pool name.
    pub routes: HashMap<String, String>,

    /// Pool serving the default routing prefix.
    pub default_pool: Option<String>,
}

/// Pool category; affects server accounting and regional semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    #[default]
    Regular,
    Regional,
    Other,
}

/// One backend pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Backend addresses, `host:port`.
    pub servers: Vec<String>,

    /// Wire protocol spoken to these backends.
    pub protocol: Protocol,

    /// Transport under the protocol.
    pub transport: Transport,

    pub pool_type: PoolType,

    /// Forward keys with their routing prefix intact.
    pub keep_routing_prefix: bool,

    /// Optional shadowing policy. Validated field by field, not by serde;
    /// see the shadow module.
    pub shadowing_policy: Option<Value>,

    /// Optional failover policy.
    pub failover: Option<FailoverConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            protocol: Protocol::Ascii,
            transport: Transport::Tcp,
            pool_type: PoolType::Regular,
            keep_routing_prefix: false,
            shadowing_policy: None,
            failover: None,
        }
    }
}

/// Per-pool failover settings, consumed by interior route handles.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FailoverConfig {
    /// Operations failover applies to (e.g. "get", "set").
    pub ops: Vec<String>,

    /// Expiration override applied to failed-over stores.
    pub exptime: u32,
}

/// An ongoing pool migration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MigratedPoolConfig {
    pub from: String,
    pub to: String,

    /// Migration start, seconds since epoch.
    pub migration_start_ts: u64,

    /// Length of each migration phase.
    pub migration_interval_secs: u64,

    /// Expiration applied to warm-up stores on the destination pool.
    #[serde(default)]
    pub warmup_exptime: u32,
}
