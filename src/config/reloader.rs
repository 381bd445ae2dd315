//! Reconfiguration control path.
//!
//! # Responsibilities
//! - Own the worker set and the process-wide reconfig lock
//! - Build one snapshot per worker, all-or-nothing
//! - Swap and schedule old-snapshot teardown on each worker's loop
//!
//! # Design Decisions
//! - Runs on the control thread; workers only ever see complete snapshots
//! - A failed build leaves every worker on its previous config and bumps
//!   `config_failures`

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::builder::build_snapshot;
use crate::config::schema::RouterOptions;
use crate::config::ConfigError;
use crate::observability::metrics;
use crate::pool::client::TransportFactory;
use crate::runtime_vars::ObservableRuntimeVars;
use crate::worker::proxy::{Proxy, ProxyLoop};

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A router instance: N independent workers plus the control-plane state
/// shared between them.
pub struct Router {
    options: RouterOptions,
    proxies: Vec<Arc<Proxy>>,
    transport_factory: Arc<dyn TransportFactory>,
    runtime_vars: Arc<ObservableRuntimeVars>,
    reconfig_lock: Mutex<()>,
    config_failures: AtomicU64,
    last_config_attempt: AtomicU64,
}

impl Router {
    /// Create the workers. The returned [`ProxyLoop`]s must each be driven
    /// on their own task; a worker serves nothing until its loop runs.
    pub fn new(
        options: RouterOptions,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> (Self, Vec<ProxyLoop>) {
        let count = options.num_proxies.max(1);
        let mut proxies = Vec::with_capacity(count);
        let mut loops = Vec::with_capacity(count);
        for id in 0..count {
            let (proxy, proxy_loop) = Proxy::new(id, options.clone());
            proxies.push(proxy);
            loops.push(proxy_loop);
        }
        (
            Self {
                options,
                proxies,
                transport_factory,
                runtime_vars: Arc::new(ObservableRuntimeVars::new()),
                reconfig_lock: Mutex::new(()),
                config_failures: AtomicU64::new(0),
                last_config_attempt: AtomicU64::new(0),
            },
            loops,
        )
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub fn proxies(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }

    pub fn proxy(&self, index: usize) -> &Arc<Proxy> {
        &self.proxies[index]
    }

    pub fn runtime_vars(&self) -> &Arc<ObservableRuntimeVars> {
        &self.runtime_vars
    }

    pub fn config_failures(&self) -> u64 {
        self.config_failures.load(Ordering::Relaxed)
    }

    pub fn last_config_attempt_epoch_secs(&self) -> u64 {
        self.last_config_attempt.load(Ordering::Relaxed)
    }

    /// (Re)configure every worker from `input`. On error no worker is
    /// swapped.
    pub fn configure(&self, input: &str) -> Result<(), ConfigError> {
        let _guard = self
            .reconfig_lock
            .lock()
            .expect("reconfig lock poisoned");
        // mark the attempt first, so a successful config is always >= the
        // last attempt
        self.last_config_attempt.store(epoch_secs(), Ordering::Relaxed);

        match self.configure_locked(input) {
            Ok(()) => {
                metrics::record_config_reload(true);
                Ok(())
            }
            Err(err) => {
                self.config_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_config_reload(false);
                tracing::error!(error = %err, "failed to build new configuration");
                Err(err)
            }
        }
    }

    fn configure_locked(&self, input: &str) -> Result<(), ConfigError> {
        let mut snapshots = Vec::with_capacity(self.proxies.len());
        for proxy in &self.proxies {
            let default_route = proxy
                .default_route()
                .ok_or(ConfigError::EmptyDefaultRoute)?;

            // connections may be reused by the new config; whatever is left
            // unclaimed gets swept by the worker's housekeeping timer
            proxy.client_table().mark_all_unused();

            snapshots.push(build_snapshot(
                input,
                default_route,
                proxy.client_table(),
                &*self.transport_factory,
                Some(&*self.runtime_vars),
            )?);
        }

        let md5 = snapshots[0].md5().to_string();
        let clients = snapshots[0].clients().len();
        let pools = snapshots[0].pools().len();

        for (proxy, snapshot) in self.proxies.iter().zip(snapshots) {
            proxy.swap_config(snapshot);
        }

        tracing::info!(
            proxies = self.proxies.len(),
            clients,
            pools,
            md5 = %md5,
            "reconfigured"
        );
        Ok(())
    }

    /// Configure from a file on disk.
    pub fn configure_from_file(&self, path: &Path) -> Result<(), ConfigError> {
        let input = std::fs::read_to_string(path)?;
        self.configure(&input)
    }

    /// Publish a runtime-vars payload to every subscriber.
    pub fn publish_runtime_vars(&self, input: &str) -> Result<(), ConfigError> {
        self.runtime_vars
            .publish_json(input)
            .map_err(|e| ConfigError::Logic(e.to_string()))
    }

    /// Stop every worker. Pending requests receive terminal replies as each
    /// loop drains.
    pub fn shutdown(&self) {
        for proxy in &self.proxies {
            proxy.shutdown();
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("proxies", &self.proxies.len())
            .field("config_failures", &self.config_failures())
            .finish()
    }
}
