//! Backend client abstraction.
//!
//! # Responsibilities
//! - Identify a backend by (address, protocol, transport)
//! - Gate sends on TKO state with failure hysteresis
//! - Track the owning pool without keeping it alive

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::pools::Pool;
use crate::worker::request::{McMsg, Reply};

/// Wire protocol spoken to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ascii,
    Umbrella,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ascii => write!(f, "ascii"),
            Protocol::Umbrella => write!(f, "umbrella"),
        }
    }
}

/// Transport under the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Client identity. Two config generations that name the same identity share
/// one live client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub addr: SocketAddr,
    pub protocol: Protocol,
    pub transport: Transport,
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.addr, self.protocol, self.transport)
    }
}

/// Errors a transport can surface. All but `Internal` are backend-observable
/// and become reply result codes; `Internal` is a dispatch failure and
/// propagates to the task boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("request timed out")]
    Timeout,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("{0}")]
    Internal(String),
}

/// The connection object behind a client. Implementations own sockets,
/// keep-alive, and per-request deadlines; none of that lives here.
pub trait BackendTransport: Send + Sync {
    fn send<'a>(&'a self, msg: &'a McMsg) -> BoxFuture<'a, Result<Reply, TransportError>>;

    /// Reclaim idle resources. Invoked by the inactivity timer.
    fn close_idle(&self) {}
}

/// Creates transports for clients as the config builder materializes them.
pub trait TransportFactory: Send + Sync {
    fn create(&self, identity: &ClientIdentity) -> Arc<dyn BackendTransport>;
}

/// Observer hooks around client traffic. A worker carries at most one
/// monitor; every method has a no-op default.
pub trait ClientMonitor: Send + Sync {
    /// Veto a send. A refused send is reported to the caller as TKO.
    fn may_send(&self, _client: &BackendClient, _msg: &McMsg) -> bool {
        true
    }

    fn on_response(&self, _client: &BackendClient, _reply: &Reply) {}

    /// The client just crossed its failure threshold.
    fn on_down(&self, _client: &BackendClient) {}

    /// The client was swept out of the table.
    fn remove_client(&self, _client: &BackendClient) {}
}

struct PoolRef {
    pool_id: u64,
    pool: Weak<Pool>,
}

/// One live backend client.
pub struct BackendClient {
    identity: ClientIdentity,
    transport: Arc<dyn BackendTransport>,
    failures_until_tko: u32,
    consecutive_failures: AtomicU32,
    tko: AtomicBool,
    unused: AtomicBool,
    pool_ref: Mutex<Option<PoolRef>>,
    last_active: Mutex<Instant>,
}

impl BackendClient {
    pub fn new(
        identity: ClientIdentity,
        transport: Arc<dyn BackendTransport>,
        failures_until_tko: u32,
    ) -> Self {
        Self {
            identity,
            transport,
            failures_until_tko,
            consecutive_failures: AtomicU32::new(0),
            tko: AtomicBool::new(false),
            unused: AtomicBool::new(false),
            pool_ref: Mutex::new(None),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &Arc<dyn BackendTransport> {
        &self.transport
    }

    pub fn is_tko(&self) -> bool {
        self.tko.load(Ordering::Relaxed)
    }

    pub fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.tko.swap(false, Ordering::Relaxed) {
            tracing::info!(client = %self.identity, "backend recovered from tko");
        }
    }

    /// Returns true when this failure crossed the TKO threshold.
    pub fn note_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.failures_until_tko > 0
            && failures >= self.failures_until_tko
            && !self.tko.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                client = %self.identity,
                failures,
                "backend marked tko"
            );
            return true;
        }
        false
    }

    pub fn mark_unused(&self) {
        self.unused.store(true, Ordering::Relaxed);
    }

    pub fn mark_used(&self) {
        self.unused.store(false, Ordering::Relaxed);
    }

    pub fn is_unused(&self) -> bool {
        self.unused.load(Ordering::Relaxed)
    }

    /// Point this client at `pool`. Reconfiguration calls this every time a
    /// client is placed into a new generation's pool.
    pub fn assign_pool(&self, pool: &Arc<Pool>) {
        let mut guard = self.pool_ref.lock().expect("pool ref mutex poisoned");
        *guard = Some(PoolRef {
            pool_id: pool.id(),
            pool: Arc::downgrade(pool),
        });
    }

    pub fn pool(&self) -> Option<Arc<Pool>> {
        let guard = self.pool_ref.lock().expect("pool ref mutex poisoned");
        guard.as_ref().and_then(|r| r.pool.upgrade())
    }

    /// Clear the back-reference, but only if it still points at `pool_id`.
    /// A stale pool tearing down after reconfiguration reassigned this
    /// client must not touch the new assignment.
    pub fn clear_pool_if(&self, pool_id: u64) {
        let mut guard = self.pool_ref.lock().expect("pool ref mutex poisoned");
        if guard.as_ref().map(|r| r.pool_id) == Some(pool_id) {
            *guard = None;
        }
    }

    pub fn touch(&self) {
        *self.last_active.lock().expect("last active mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock().expect("last active mutex poisoned"))
    }
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("identity", &self.identity)
            .field("tko", &self.is_tko())
            .field("unused", &self.is_unused())
            .finish()
    }
}
