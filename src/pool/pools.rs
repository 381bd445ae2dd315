//! Pool definitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::pool::client::BackendClient;
use crate::worker::request::McOp;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// What kind of pool this is. Migrated pools drain traffic from one pool
/// into another over a time window.
#[derive(Clone)]
pub enum PoolKind {
    Regular,
    Regional,
    Migrated {
        from: Arc<Pool>,
        to: Arc<Pool>,
        migration_start_ts: u64,
        migration_interval_secs: u64,
        warmup_exptime: u32,
    },
    Other,
}

impl std::fmt::Debug for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Regular => write!(f, "regular"),
            PoolKind::Regional => write!(f, "regional"),
            PoolKind::Migrated { from, to, .. } => {
                write!(f, "migrated({} -> {})", from.name(), to.name())
            }
            PoolKind::Other => write!(f, "other"),
        }
    }
}

/// Per-operation failover toggles. Interior route handles consult this;
/// the pool only carries it.
#[derive(Debug, Clone, Default)]
pub struct FailoverPolicy {
    enabled_ops: Vec<McOp>,
    pub failover_exptime: u32,
}

impl FailoverPolicy {
    pub fn new(enabled_ops: Vec<McOp>, failover_exptime: u32) -> Self {
        Self {
            enabled_ops,
            failover_exptime,
        }
    }

    pub fn enabled_for(&self, op: McOp) -> bool {
        self.enabled_ops.contains(&op)
    }
}

/// A named group of backend clients.
pub struct Pool {
    name: String,
    id: u64,
    kind: PoolKind,
    keep_routing_prefix: bool,
    failover: Option<FailoverPolicy>,
    clients: Mutex<Vec<Weak<BackendClient>>>,
}

impl Pool {
    pub fn new(
        name: String,
        kind: PoolKind,
        keep_routing_prefix: bool,
        failover: Option<FailoverPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            keep_routing_prefix,
            failover,
            clients: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &PoolKind {
        &self.kind
    }

    pub fn keep_routing_prefix(&self) -> bool {
        self.keep_routing_prefix
    }

    pub fn failover(&self) -> Option<&FailoverPolicy> {
        self.failover.as_ref()
    }

    /// Place `client` into this pool and point its back-reference here.
    pub fn adopt_client(self: &Arc<Self>, client: &Arc<BackendClient>) {
        self.clients
            .lock()
            .expect("pool clients mutex poisoned")
            .push(Arc::downgrade(client));
        client.assign_pool(self);
    }

    /// Live clients, in insertion order.
    pub fn clients(&self) -> Vec<Arc<BackendClient>> {
        self.clients
            .lock()
            .expect("pool clients mutex poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Only clear back-pointers that still name this pool; reconfiguration
        // may have reassigned a surviving client before this pool was torn
        // down.
        let clients = self.clients.lock().expect("pool clients mutex poisoned");
        for weak in clients.iter() {
            if let Some(client) = weak.upgrade() {
                client.clear_pool_if(self.id);
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("clients", &self.client_count())
            .finish()
    }
}
