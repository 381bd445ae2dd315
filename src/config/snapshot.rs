//! Immutable config snapshots and the reader/writer cell holding them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::pool::client::{BackendClient, ClientIdentity};
use crate::pool::pools::{Pool, PoolKind};
use crate::routing::proxy_route::ProxyRoute;
use crate::worker::service_info::ServiceInfo;

/// Everything one configuration generation produced. Immutable; requests
/// pin the snapshot they dispatched against until they complete.
pub struct ConfigSnapshot {
    proxy_route: Arc<ProxyRoute>,
    pools: HashMap<String, Arc<Pool>>,
    clients: HashMap<ClientIdentity, Arc<BackendClient>>,
    service_info: ServiceInfo,
    md5: String,
    loaded_at: SystemTime,
}

impl ConfigSnapshot {
    pub fn new(
        proxy_route: Arc<ProxyRoute>,
        pools: HashMap<String, Arc<Pool>>,
        clients: HashMap<ClientIdentity, Arc<BackendClient>>,
        md5: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            proxy_route,
            pools,
            clients,
            service_info: ServiceInfo::new(),
            md5,
            loaded_at: SystemTime::now(),
        })
    }

    pub fn proxy_route(&self) -> &Arc<ProxyRoute> {
        &self.proxy_route
    }

    pub fn pools(&self) -> &HashMap<String, Arc<Pool>> {
        &self.pools
    }

    pub fn clients(&self) -> &HashMap<ClientIdentity, Arc<BackendClient>> {
        &self.clients
    }

    pub fn service_info(&self) -> &ServiceInfo {
        &self.service_info
    }

    pub fn md5(&self) -> &str {
        &self.md5
    }

    pub fn age_secs(&self) -> u64 {
        self.loaded_at
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    pub fn loaded_at_epoch_secs(&self) -> u64 {
        self.loaded_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Servers counted for `num_servers_stat`: regular and regional pools
    /// only, matching the stats contract.
    pub fn num_servers(&self) -> u64 {
        self.pools
            .values()
            .filter(|p| matches!(p.kind(), PoolKind::Regular | PoolKind::Regional))
            .map(|p| p.client_count() as u64)
            .sum()
    }
}

impl std::fmt::Debug for ConfigSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSnapshot")
            .field("md5", &self.md5)
            .field("pools", &self.pools.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

/// Single-writer / many-reader cell. `get` is the hot path: one read lock
/// and one refcount bump.
#[derive(Debug, Default)]
pub struct ConfigCell {
    inner: RwLock<Option<Arc<ConfigSnapshot>>>,
}

impl ConfigCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<ConfigSnapshot>> {
        self.inner.read().expect("config cell poisoned").clone()
    }

    /// Install `new` and hand back the previous snapshot so the caller can
    /// schedule its teardown.
    pub fn swap(&self, new: Arc<ConfigSnapshot>) -> Option<Arc<ConfigSnapshot>> {
        let mut guard = self.inner.write().expect("config cell poisoned");
        guard.replace(new)
    }
}
