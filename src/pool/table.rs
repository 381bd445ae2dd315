//! Backend client table.
//!
//! # Responsibilities
//! - Own every live client, keyed by identity
//! - Reuse clients across reconfigurations (mark-unused / sweep)
//! - Reclaim connections idle past the reset interval
//!
//! # Design Decisions
//! - Concurrent map: the builder writes from the control thread while the
//!   worker's route handles read

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::pool::client::{BackendClient, ClientIdentity, TransportFactory};

pub struct ClientTable {
    clients: DashMap<ClientIdentity, Arc<BackendClient>>,
    failures_until_tko: u32,
}

impl ClientTable {
    pub fn new(failures_until_tko: u32) -> Self {
        Self {
            clients: DashMap::new(),
            failures_until_tko,
        }
    }

    /// Return the client for `identity`, creating it through `factory` on
    /// first sight. An existing client is marked used so the next sweep
    /// keeps it.
    pub fn lookup_or_insert(
        &self,
        identity: ClientIdentity,
        factory: &dyn TransportFactory,
    ) -> Arc<BackendClient> {
        if let Some(existing) = self.clients.get(&identity) {
            existing.mark_used();
            return Arc::clone(&existing);
        }
        let transport = factory.create(&identity);
        let client = Arc::new(BackendClient::new(
            identity.clone(),
            transport,
            self.failures_until_tko,
        ));
        self.clients.insert(identity, Arc::clone(&client));
        client
    }

    pub fn get(&self, identity: &ClientIdentity) -> Option<Arc<BackendClient>> {
        self.clients.get(identity).map(|c| Arc::clone(&c))
    }

    pub fn mark_all_unused(&self) {
        for entry in self.clients.iter() {
            entry.mark_unused();
        }
    }

    /// Drop every client the latest config build did not claim, returning
    /// the removed entries so the caller can notify its monitor.
    pub fn sweep_unused(&self) -> Vec<Arc<BackendClient>> {
        let stale: Vec<ClientIdentity> = self
            .clients
            .iter()
            .filter(|entry| entry.is_unused())
            .map(|entry| entry.key().clone())
            .collect();
        let mut swept = Vec::with_capacity(stale.len());
        for identity in stale {
            if let Some((_, client)) = self.clients.remove(&identity) {
                swept.push(client);
            }
        }
        if !swept.is_empty() {
            tracing::debug!(swept = swept.len(), "swept unused backend clients");
        }
        swept
    }

    /// Ask transports of long-idle clients to shed their connections.
    pub fn reset_inactive(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let now = Instant::now();
        for entry in self.clients.iter() {
            if entry.idle_for(now) >= interval {
                tracing::debug!(client = %entry.identity(), "resetting inactive connection");
                entry.transport().close_idle();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ClientTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTable")
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::client::{BackendTransport, Protocol, Transport, TransportError};
    use crate::worker::request::{McMsg, Reply};
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;

    struct NullTransport;

    impl BackendTransport for NullTransport {
        fn send<'a>(&'a self, _msg: &'a McMsg) -> BoxFuture<'a, Result<Reply, TransportError>> {
            async { Err(TransportError::Connect("null".into())) }.boxed()
        }
    }

    struct NullFactory;

    impl TransportFactory for NullFactory {
        fn create(&self, _identity: &ClientIdentity) -> Arc<dyn BackendTransport> {
            Arc::new(NullTransport)
        }
    }

    fn identity(port: u16) -> ClientIdentity {
        ClientIdentity {
            addr: format!("127.0.0.1:{port}").parse().unwrap(),
            protocol: Protocol::Ascii,
            transport: Transport::Tcp,
        }
    }

    #[test]
    fn reuse_across_reconfiguration() {
        let table = ClientTable::new(3);
        let a = table.lookup_or_insert(identity(1), &NullFactory);
        let _b = table.lookup_or_insert(identity(2), &NullFactory);
        assert_eq!(table.len(), 2);

        // new config claims only client 1
        table.mark_all_unused();
        let a2 = table.lookup_or_insert(identity(1), &NullFactory);
        assert!(Arc::ptr_eq(&a, &a2));

        let swept = table.sweep_unused();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].identity().addr.port(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.get(&identity(2)).is_none());
    }
}
