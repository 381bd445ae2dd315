//! Configuration validation logic.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::RoutingConfig;
use crate::pool::shadow::ShadowData;
use crate::routing::prefix::RoutingPrefix;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a RoutingConfig for semantic correctness.
pub fn validate_config(config: &RoutingConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let pool_names: HashSet<&str> = config.pools.keys().map(String::as_str).collect();

    // 1. Routes must use well-formed prefixes and point at routable pools.
    for (prefix, pool) in &config.routes {
        if prefix.parse::<RoutingPrefix>().is_err() {
            errors.push(ValidationError(format!(
                "route prefix '{prefix}' should be of the form /region/cluster/"
            )));
        }
        if !pool_names.contains(pool.as_str()) {
            errors.push(ValidationError(format!(
                "route '{prefix}' references unknown pool '{pool}'"
            )));
        }
    }
    if let Some(pool) = &config.default_pool {
        if !pool_names.contains(pool.as_str()) {
            errors.push(ValidationError(format!(
                "default_pool references unknown pool '{pool}'"
            )));
        }
    }

    // 2. Pool contents.
    for (name, pool) in &config.pools {
        if pool.servers.is_empty() {
            errors.push(ValidationError(format!("pool '{name}' has no servers")));
        }
        for server in &pool.servers {
            if server.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError(format!(
                    "pool '{name}' has invalid server address '{server}'"
                )));
            }
        }
        if let Some(policy) = &pool.shadowing_policy {
            match ShadowData::from_json(policy) {
                Err(err) => errors.push(ValidationError(format!(
                    "pool '{name}' shadowing_policy: {err}"
                ))),
                Ok(data) => {
                    if let Some(shadow_pool) = &data.shadow_pool {
                        if !pool_names.contains(shadow_pool.as_str()) {
                            errors.push(ValidationError(format!(
                                "pool '{name}' shadows into unknown pool '{shadow_pool}'"
                            )));
                        }
                    }
                }
            }
        }
    }

    // 3. Migrated pools must reference real pools.
    for (name, migrated) in &config.migrated_pools {
        for (label, target) in [("from", &migrated.from), ("to", &migrated.to)] {
            if !pool_names.contains(target.as_str()) {
                errors.push(ValidationError(format!(
                    "migrated pool '{name}' {label}-pool '{target}' does not exist"
                )));
            }
        }
        if migrated.migration_interval_secs == 0 {
            errors.push(ValidationError(format!(
                "migrated pool '{name}' migration_interval_secs must be > 0"
            )));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
