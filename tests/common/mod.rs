//! Shared utilities for integration testing: mock transports and worker
//! bootstrap helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;

use memroute::pool::client::{
    BackendTransport, ClientIdentity, TransportError, TransportFactory,
};
use memroute::worker::proxy::{Proxy, ProxyLoop};
use memroute::worker::request::{McMsg, McOp, McResult, Reply};
use memroute::{Router, RouterOptions};

/// Answers immediately: gets are found and echo their key, stores succeed.
pub struct EchoTransport;

impl BackendTransport for EchoTransport {
    fn send<'a>(&'a self, msg: &'a McMsg) -> BoxFuture<'a, Result<Reply, TransportError>> {
        let reply = match msg.op {
            McOp::Get | McOp::LeaseGet | McOp::Metaget => {
                Reply::with_value(msg.op, McResult::Found, msg.key.clone().into_bytes())
            }
            McOp::Set | McOp::Add | McOp::Replace | McOp::LeaseSet => {
                Reply::new(msg.op, McResult::Stored)
            }
            McOp::Delete => Reply::new(msg.op, McResult::Deleted),
            _ => Reply::new(msg.op, McResult::Ok),
        };
        async move { Ok(reply) }.boxed()
    }
}

/// Always fails with the configured error.
pub struct FailTransport {
    pub error: fn() -> TransportError,
}

impl BackendTransport for FailTransport {
    fn send<'a>(&'a self, _msg: &'a McMsg) -> BoxFuture<'a, Result<Reply, TransportError>> {
        async move { Err((self.error)()) }.boxed()
    }
}

/// Counts sends and then answers like [`EchoTransport`].
#[derive(Default)]
pub struct CountingTransport {
    pub sends: AtomicUsize,
}

impl BackendTransport for CountingTransport {
    fn send<'a>(&'a self, msg: &'a McMsg) -> BoxFuture<'a, Result<Reply, TransportError>> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let reply = Reply::with_value(msg.op, McResult::Found, msg.key.clone().into_bytes());
        async move { Ok(reply) }.boxed()
    }
}

/// Holds every send until the test releases it, recording arrival order.
pub struct GatedTransport {
    pending: Mutex<VecDeque<(String, oneshot::Sender<Reply>)>>,
    arrived: Mutex<Vec<String>>,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            arrived: Mutex::new(Vec::new()),
        })
    }

    /// Keys in the order their sends reached the backend.
    pub fn arrival_order(&self) -> Vec<String> {
        self.arrived.lock().unwrap().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Poll until at least `n` sends are parked at the gate.
    pub async fn wait_for_pending(&self, n: usize) {
        for _ in 0..500 {
            if self.pending_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "timed out waiting for {n} pending sends (have {})",
            self.pending_count()
        );
    }

    /// Release the oldest parked send with a found reply echoing its key.
    pub fn release_next(&self) {
        let (key, tx) = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .expect("no pending send to release");
        let _ = tx.send(Reply::with_value(
            McOp::Get,
            McResult::Found,
            key.into_bytes(),
        ));
    }

    pub fn release_all(&self) {
        while self.pending_count() > 0 {
            self.release_next();
        }
    }
}

impl BackendTransport for GatedTransport {
    fn send<'a>(&'a self, msg: &'a McMsg) -> BoxFuture<'a, Result<Reply, TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.arrived.lock().unwrap().push(msg.key.clone());
        self.pending.lock().unwrap().push_back((msg.key.clone(), tx));
        async move {
            match rx.await {
                Ok(reply) => Ok(reply),
                Err(_) => Err(TransportError::Timeout),
            }
        }
        .boxed()
    }
}

/// Hands the same transport to every client identity.
pub struct SharedFactory(pub Arc<dyn BackendTransport>);

impl TransportFactory for SharedFactory {
    fn create(&self, _identity: &ClientIdentity) -> Arc<dyn BackendTransport> {
        Arc::clone(&self.0)
    }
}

/// Routes each identity's port to a dedicated transport via the closure.
pub struct PortFactory(pub Box<dyn Fn(u16) -> Arc<dyn BackendTransport> + Send + Sync>);

impl TransportFactory for PortFactory {
    fn create(&self, identity: &ClientIdentity) -> Arc<dyn BackendTransport> {
        (self.0)(identity.addr.port())
    }
}

pub fn default_options() -> RouterOptions {
    RouterOptions {
        default_route: "/oregon/main/".to_string(),
        // keep the housekeeping tick out of short tests
        housekeeping_interval_ms: 3_600_000,
        ..RouterOptions::default()
    }
}

/// One pool, one server, routed at the default prefix.
pub const SINGLE_POOL_BLOB: &str = r#"{
    "pools": {"main": {"servers": ["127.0.0.1:11211"]}},
    "default_pool": "main"
}"#;

/// Start a single-worker router with its loop spawned.
pub fn start_router(
    options: RouterOptions,
    factory: Arc<dyn TransportFactory>,
) -> (Router, Arc<Proxy>, tokio::task::JoinHandle<()>) {
    let (router, mut loops) = Router::new(options, factory);
    assert_eq!(loops.len(), 1);
    let proxy = Arc::clone(loops[0].proxy());
    let handle = tokio::spawn(run_loop(loops.remove(0)));
    (router, proxy, handle)
}

async fn run_loop(proxy_loop: ProxyLoop) {
    proxy_loop.run().await;
}

/// Submit a request and hand back the reply future.
pub fn submit(proxy: &Arc<Proxy>, msg: McMsg) -> oneshot::Receiver<Reply> {
    let (tx, rx) = oneshot::channel();
    proxy
        .submit(
            msg,
            0,
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        )
        .expect("submit failed");
    rx
}

/// Poll until `cond` holds or a generous deadline passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
