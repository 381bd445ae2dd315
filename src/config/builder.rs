//! Snapshot builder.
//!
//! # Responsibilities
//! - Turn a validated config blob into pools, clients, and the route tree
//! - Reuse surviving clients from the worker's table
//! - Stamp the snapshot with the blob's md5 digest

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::schema::{PoolConfig, PoolType, RoutingConfig};
use crate::config::snapshot::ConfigSnapshot;
use crate::config::validation::validate_config;
use crate::config::ConfigError;
use crate::pool::client::{ClientIdentity, TransportFactory};
use crate::pool::pools::{FailoverPolicy, Pool, PoolKind};
use crate::pool::shadow::{ShadowData, ShadowingPolicy};
use crate::pool::table::ClientTable;
use crate::routing::handle::RouteHandleRef;
use crate::routing::destination::DestinationRoute;
use crate::routing::pool_route::PoolRoute;
use crate::routing::prefix::RoutingPrefix;
use crate::routing::proxy_route::ProxyRoute;
use crate::runtime_vars::ObservableRuntimeVars;
use crate::worker::request::McOp;

/// Build one worker's snapshot from the config blob.
///
/// Clients are claimed through `table.lookup_or_insert`, so identities that
/// survive from the previous generation keep their live connections. The
/// caller is expected to have marked the table unused beforehand; entries
/// left unclaimed are swept later by the worker's housekeeping timer.
pub fn build_snapshot(
    input: &str,
    default_route: &RoutingPrefix,
    table: &ClientTable,
    factory: &dyn TransportFactory,
    runtime_vars: Option<&ObservableRuntimeVars>,
) -> Result<Arc<ConfigSnapshot>, ConfigError> {
    let config: RoutingConfig = serde_json::from_str(input)?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    let mut pools: HashMap<String, Arc<Pool>> = HashMap::new();
    let mut clients = HashMap::new();
    let mut destinations: HashMap<String, Vec<RouteHandleRef>> = HashMap::new();

    // Regular pools first; migrated pools reference them.
    for (name, pool_config) in &config.pools {
        let pool = Pool::new(
            name.clone(),
            pool_kind(pool_config.pool_type),
            pool_config.keep_routing_prefix,
            failover_policy(pool_config)?,
        );

        let mut leaves: Vec<RouteHandleRef> = Vec::with_capacity(pool_config.servers.len());
        for server in &pool_config.servers {
            let identity = ClientIdentity {
                // validated above
                addr: server
                    .parse()
                    .map_err(|_| ConfigError::Logic(format!("invalid address {server}")))?,
                protocol: pool_config.protocol,
                transport: pool_config.transport,
            };
            let client = table.lookup_or_insert(identity.clone(), factory);
            pool.adopt_client(&client);
            clients.insert(identity, Arc::clone(&client));
            leaves.push(DestinationRoute::new(client) as RouteHandleRef);
        }

        destinations.insert(name.clone(), leaves);
        pools.insert(name.clone(), pool);
    }

    for (name, migrated) in &config.migrated_pools {
        let from = Arc::clone(&pools[&migrated.from]);
        let to = Arc::clone(&pools[&migrated.to]);
        let pool = Pool::new(
            name.clone(),
            PoolKind::Migrated {
                from,
                to,
                migration_start_ts: migrated.migration_start_ts,
                migration_interval_secs: migrated.migration_interval_secs,
                warmup_exptime: migrated.warmup_exptime,
            },
            false,
            None,
        );
        pools.insert(name.clone(), pool);
    }

    // Plain per-pool routes, then a shadowed variant where configured.
    let mut base_routes: HashMap<String, Arc<PoolRoute>> = HashMap::new();
    for (name, leaves) in &destinations {
        base_routes.insert(
            name.clone(),
            PoolRoute::new(Arc::clone(&pools[name]), leaves.clone(), None),
        );
    }

    let mut pool_routes: HashMap<String, Arc<PoolRoute>> = HashMap::new();
    for (name, pool_config) in &config.pools {
        let route = match shadow_split(pool_config, &base_routes, runtime_vars)? {
            Some(shadow) => PoolRoute::new(
                Arc::clone(&pools[name]),
                destinations[name].clone(),
                Some(shadow),
            ),
            None => Arc::clone(&base_routes[name]),
        };
        pool_routes.insert(name.clone(), route);
    }

    let mut routes: HashMap<String, Arc<PoolRoute>> = HashMap::new();
    for (prefix, pool_name) in &config.routes {
        let prefix: RoutingPrefix = prefix
            .parse()
            .map_err(|e| ConfigError::Logic(format!("{e}")))?;
        routes.insert(
            prefix.as_str().to_string(),
            Arc::clone(&pool_routes[pool_name]),
        );
    }
    if let Some(default_pool) = &config.default_pool {
        routes
            .entry(default_route.as_str().to_string())
            .or_insert_with(|| Arc::clone(&pool_routes[default_pool]));
    }

    let proxy_route = ProxyRoute::new(routes, default_route.clone());
    let md5 = format!("{:x}", md5::compute(input.as_bytes()));

    Ok(ConfigSnapshot::new(proxy_route, pools, clients, md5))
}

fn pool_kind(pool_type: PoolType) -> PoolKind {
    match pool_type {
        PoolType::Regular => PoolKind::Regular,
        PoolType::Regional => PoolKind::Regional,
        PoolType::Other => PoolKind::Other,
    }
}

fn failover_policy(pool_config: &PoolConfig) -> Result<Option<FailoverPolicy>, ConfigError> {
    let Some(failover) = &pool_config.failover else {
        return Ok(None);
    };
    let mut ops = Vec::with_capacity(failover.ops.len());
    for op in &failover.ops {
        ops.push(
            op.parse::<McOp>()
                .map_err(|_| ConfigError::Logic(format!("failover: unknown op '{op}'")))?,
        );
    }
    Ok(Some(FailoverPolicy::new(ops, failover.exptime)))
}

fn shadow_split(
    pool_config: &PoolConfig,
    base_routes: &HashMap<String, Arc<PoolRoute>>,
    runtime_vars: Option<&ObservableRuntimeVars>,
) -> Result<Option<(Arc<ShadowingPolicy>, RouteHandleRef)>, ConfigError> {
    let Some(policy_json) = &pool_config.shadowing_policy else {
        return Ok(None);
    };
    let data = ShadowData::from_json(policy_json)?;
    let Some(shadow_pool) = data.shadow_pool.clone() else {
        // a policy without a target pool shadows nothing
        return Ok(None);
    };
    let target = Arc::clone(&base_routes[&shadow_pool]) as RouteHandleRef;
    let policy = Arc::new(ShadowingPolicy::with_data(data, runtime_vars)?);
    Ok(Some((policy, target)))
}
