//! The worker.
//!
//! # Responsibilities
//! - Drain the request queue on a single loop
//! - Enforce the in-flight admission gate with FIFO promotion
//! - Spawn one task per routed request, with an error boundary that turns
//!   dispatch failures into `local-error` replies
//! - Swap config snapshots and tear old ones down on this loop

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::schema::RouterOptions;
use crate::config::snapshot::{ConfigCell, ConfigSnapshot};
use crate::observability::metrics;
use crate::pool::client::ClientMonitor;
use crate::pool::table::ClientTable;
use crate::routing::handle::{RequestCtx, RouteHandle};
use crate::routing::prefix::RoutingPrefix;
use crate::stats::counters::{ProxyStats, Stat};
use crate::stats::rtt::RttTimer;
use crate::worker::request::{
    McMsg, McOp, McResult, ProxyRequest, Reply, ReplyCallback, SubmitError,
};
use crate::worker::service_info;

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Messages drained by the worker loop. The queue is the only cross-thread
/// surface into a worker.
pub enum ProxyMessage {
    /// A freshly submitted request.
    Request(Arc<ProxyRequest>),

    /// A routed request's task finished: deliver the reply and drop the
    /// request context here, with the full stack of the loop.
    Finalize {
        request: Arc<ProxyRequest>,
        ctx: Arc<RequestCtx>,
        reply: Reply,
    },

    /// A superseded config snapshot, scheduled for teardown on this loop
    /// because route teardown may touch worker-local state.
    OldConfig(Arc<ConfigSnapshot>),

    Shutdown,
}

/// One worker.
pub struct Proxy {
    id: usize,
    host_id: Uuid,
    options: RouterOptions,
    default_route: Option<RoutingPrefix>,
    stats: ProxyStats,
    rtt: RttTimer,
    config: ConfigCell,
    clients: ClientTable,
    waiting: Mutex<VecDeque<Arc<ProxyRequest>>>,
    num_processing: AtomicUsize,
    queue_tx: mpsc::UnboundedSender<ProxyMessage>,
    monitor: Mutex<Option<Arc<dyn ClientMonitor>>>,
    being_destroyed: AtomicBool,
}

impl Proxy {
    /// Create a worker and the loop that drives it. The loop must be
    /// spawned by the caller.
    pub fn new(id: usize, options: RouterOptions) -> (Arc<Self>, ProxyLoop) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let default_route = if options.default_route.is_empty() {
            None
        } else {
            match options.default_route.parse::<RoutingPrefix>() {
                Ok(prefix) => Some(prefix),
                Err(err) => {
                    // leaving the default route unset makes the next
                    // configure attempt fail with a clear error
                    tracing::error!(error = %err, "invalid default route");
                    None
                }
            }
        };

        let rtt = RttTimer::new(options.rtt_smoothing_factor);
        let clients = ClientTable::new(options.failures_until_tko);

        let proxy = Arc::new(Self {
            id,
            host_id: Uuid::new_v4(),
            options,
            default_route,
            stats: ProxyStats::new(),
            rtt,
            config: ConfigCell::new(),
            clients,
            waiting: Mutex::new(VecDeque::new()),
            num_processing: AtomicUsize::new(0),
            queue_tx,
            monitor: Mutex::new(None),
            being_destroyed: AtomicBool::new(false),
        });

        let proxy_loop = ProxyLoop {
            proxy: Arc::clone(&proxy),
            queue_rx,
        };
        (proxy, proxy_loop)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn host_id(&self) -> Uuid {
        self.host_id
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub fn default_route(&self) -> Option<&RoutingPrefix> {
        self.default_route.as_ref()
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    pub fn rtt_timer(&self) -> &RttTimer {
        &self.rtt
    }

    pub fn client_table(&self) -> &ClientTable {
        &self.clients
    }

    /// Attach (or clear) the client monitor.
    pub fn set_monitor(&self, monitor: Option<Arc<dyn ClientMonitor>>) {
        *self.monitor.lock().expect("monitor mutex poisoned") = monitor;
    }

    pub fn monitor(&self) -> Option<Arc<dyn ClientMonitor>> {
        self.monitor.lock().expect("monitor mutex poisoned").clone()
    }

    pub fn num_requests_processing(&self) -> usize {
        self.num_processing.load(Ordering::Relaxed)
    }

    pub fn num_requests_waiting(&self) -> usize {
        self.waiting.lock().expect("waiting queue poisoned").len()
    }

    /// Current config snapshot handle, if configured.
    pub fn get_config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.config.get()
    }

    /// Install a new snapshot. The old one is posted back to this worker's
    /// queue so its teardown runs on the loop; in sync mode it is dropped
    /// in place.
    pub fn swap_config(&self, new: Arc<ConfigSnapshot>) {
        self.stats.set(Stat::NumServers, new.num_servers());
        metrics::set_num_servers(self.id, new.num_servers());

        let old = self.config.swap(new);
        self.stats.set(Stat::ConfigLastSuccess, epoch_secs());

        if let Some(old) = old {
            if !self.options.sync {
                if let Err(dropped) = self.post(ProxyMessage::OldConfig(old)) {
                    // loop already gone; nothing left to defer to
                    drop(dropped);
                }
            }
        }
    }

    /// Accept a parsed request. Never blocks; the request is queued for the
    /// worker loop. The callback fires exactly once.
    pub fn submit(
        self: &Arc<Self>,
        msg: McMsg,
        sender_id: u64,
        callback: ReplyCallback,
    ) -> Result<(), SubmitError> {
        if self.being_destroyed.load(Ordering::Relaxed) {
            return Err(SubmitError::ShuttingDown);
        }
        let request = ProxyRequest::new(Arc::clone(self), msg, sender_id, callback)?;
        self.post(ProxyMessage::Request(request))
            .map_err(|_| SubmitError::ShuttingDown)
    }

    /// Every backend client a GET for `key` might touch under the current
    /// config.
    pub fn foreach_possible_client(
        &self,
        key: &str,
        callback: impl FnMut(Arc<crate::pool::client::BackendClient>),
    ) {
        if let Some(config) = self.get_config() {
            config.proxy_route().foreach_possible_client(key, callback);
        }
    }

    /// Stop this worker. The loop drains, delivering terminal replies to
    /// anything still pending.
    pub fn shutdown(&self) {
        self.being_destroyed.store(true, Ordering::Relaxed);
        let _ = self.post(ProxyMessage::Shutdown);
    }

    fn post(&self, msg: ProxyMessage) -> Result<(), ProxyMessage> {
        self.queue_tx.send(msg).map_err(|err| err.0)
    }

    pub(crate) fn dispatch_request(self: &Arc<Self>, request: Arc<ProxyRequest>) {
        if self.rate_limited(&request) {
            self.waiting
                .lock()
                .expect("waiting queue poisoned")
                .push_back(request);
            self.stats.incr(Stat::ProxyReqsWaiting);
            metrics::record_rate_gated();
        } else {
            self.process_request(request);
        }
    }

    fn rate_limited(&self, request: &ProxyRequest) -> bool {
        let max = self.options.proxy_max_inflight_requests;
        if max == 0 {
            return false;
        }
        // stats, version, and service-info always go straight through
        if request.msg().op.is_bypass() {
            return false;
        }
        let waiting = self.waiting.lock().expect("waiting queue poisoned");
        !(waiting.is_empty() && self.num_processing.load(Ordering::Relaxed) < max)
    }

    pub(crate) fn process_request(self: &Arc<Self>, request: Arc<ProxyRequest>) {
        request.begin_processing();
        self.num_processing.fetch_add(1, Ordering::Relaxed);
        self.stats.incr(Stat::ProxyReqsProcessing);

        let (op_stat, count_stat) = match request.msg().op {
            McOp::Get => (Stat::CmdGet, Some(Stat::CmdGetCount)),
            McOp::Set => (Stat::CmdSet, Some(Stat::CmdSetCount)),
            McOp::Add => (Stat::CmdAdd, Some(Stat::CmdAddCount)),
            McOp::Replace => (Stat::CmdReplace, Some(Stat::CmdReplaceCount)),
            McOp::Delete => (Stat::CmdDelete, Some(Stat::CmdDeleteCount)),
            McOp::Incr => (Stat::CmdIncr, Some(Stat::CmdIncrCount)),
            McOp::Decr => (Stat::CmdDecr, Some(Stat::CmdDecrCount)),
            McOp::Metaget => (Stat::CmdMeta, None),
            McOp::LeaseGet => (Stat::CmdLeaseGet, Some(Stat::CmdLeaseGetCount)),
            McOp::LeaseSet => (Stat::CmdLeaseSet, Some(Stat::CmdLeaseSetCount)),
            McOp::Stats => (Stat::CmdStats, Some(Stat::CmdStatsCount)),
            _ => (Stat::CmdOther, Some(Stat::CmdOtherCount)),
        };
        self.stats.incr(op_stat);
        if let Some(count_stat) = count_stat {
            self.stats.incr(count_stat);
        }

        self.route_handles_process_request(request);

        self.stats.incr(Stat::RequestSent);
        self.stats.incr(Stat::RequestSentCount);
    }

    fn route_handles_process_request(self: &Arc<Self>, request: Arc<ProxyRequest>) {
        match request.msg().op {
            // answered on the loop, without touching the route tree
            McOp::Stats => {
                let reply = service_info::stats_reply(self, &request.msg().key);
                request.send_reply(reply);
            }
            McOp::Version => {
                let reply = Reply::with_value(
                    McOp::Version,
                    McResult::Ok,
                    service_info::version_string().into_bytes(),
                );
                request.send_reply(reply);
            }
            McOp::GetServiceInfo => {
                let reply = match self.get_config() {
                    None => Reply::local_error(McOp::GetServiceInfo, "no configuration loaded"),
                    Some(config) => {
                        let ctx = Arc::new(RequestCtx {
                            proxy: Arc::clone(self),
                            config: Arc::clone(&config),
                            sender_id: request.sender_id(),
                        });
                        // dispatch failures here become local-error replies,
                        // same as the routing path
                        match config.service_info().handle_request(&ctx, &request.msg().key) {
                            Ok(reply) => reply,
                            Err(err) => Reply::local_error(
                                McOp::GetServiceInfo,
                                format!("service info error: {err}"),
                            ),
                        }
                    }
                };
                request.send_reply(reply);
            }
            _ => self.spawn_request_task(request),
        }
    }

    fn spawn_request_task(self: &Arc<Self>, request: Arc<ProxyRequest>) {
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            let Some(config) = proxy.get_config() else {
                request.send_reply(Reply::local_error(
                    request.msg().op,
                    "no configuration loaded",
                ));
                return;
            };

            // the snapshot is pinned here; the request keeps dispatching
            // against it even if a reload swaps the cell underneath
            let ctx = Arc::new(RequestCtx {
                proxy: Arc::clone(&proxy),
                config: Arc::clone(&config),
                sender_id: request.sender_id(),
            });

            let dispatched = std::panic::AssertUnwindSafe(
                config.proxy_route().dispatch(request.msg(), &ctx),
            )
            .catch_unwind()
            .await;

            let reply = match dispatched {
                Ok(Ok(reply)) => reply,
                Ok(Err(err)) => Reply::local_error(
                    request.msg().op,
                    format!("error routing {}: {}", request.msg().key, err),
                ),
                Err(panic) => Reply::local_error(
                    request.msg().op,
                    format!(
                        "error routing {}: {}",
                        request.msg().key,
                        panic_message(&panic)
                    ),
                ),
            };

            // finalize on the loop: reply delivery and context teardown may
            // release the last reference to a stale snapshot
            let message = ProxyMessage::Finalize {
                request: Arc::clone(&request),
                ctx,
                reply,
            };
            if let Err(ProxyMessage::Finalize { request, reply, .. }) = proxy.post(message) {
                request.send_reply(reply);
            }
        });
    }

    /// A processing request finished its lifetime: release its admission
    /// slot and promote waiters.
    pub(crate) fn note_request_done(&self) {
        self.num_processing.fetch_sub(1, Ordering::Relaxed);
        self.stats.decr(Stat::ProxyReqsProcessing);
        self.pump();
    }

    /// Promote waiting requests, FIFO, while slots are free.
    fn pump(&self) {
        let max = self.options.proxy_max_inflight_requests;
        loop {
            let request = {
                let mut waiting = self.waiting.lock().expect("waiting queue poisoned");
                if waiting.is_empty()
                    || (max != 0 && self.num_processing.load(Ordering::Relaxed) >= max)
                {
                    break;
                }
                waiting.pop_front().expect("checked non-empty")
            };
            self.stats.decr(Stat::ProxyReqsWaiting);
            let proxy = Arc::clone(request.proxy());
            proxy.process_request(request);
        }
    }

    fn drain_waiting(&self) -> Vec<Arc<ProxyRequest>> {
        self.waiting
            .lock()
            .expect("waiting queue poisoned")
            .drain(..)
            .collect()
    }

    /// Housekeeping tick: flush RTT gauges, sweep clients the last config
    /// build left unclaimed, reset long-idle connections.
    pub(crate) fn housekeeping(&self) {
        self.flush_rtt_stats();
        let swept = self.clients.sweep_unused();
        if let Some(monitor) = self.monitor() {
            for client in &swept {
                monitor.remove_client(client);
            }
        }
        let reset_interval =
            Duration::from_millis(self.options.reset_inactive_connection_interval_ms);
        self.clients.reset_inactive(reset_interval);
    }

    pub fn flush_rtt_stats(&self) {
        let (min, avg, peak) = self.rtt.drain_window();
        self.stats.set(Stat::RttMin, min);
        self.stats.set(Stat::Rtt, avg);
        self.stats.set(Stat::RttMax, peak);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id)
            .field("processing", &self.num_requests_processing())
            .field("waiting", &self.num_requests_waiting())
            .finish()
    }
}

/// Owns the worker's receive side. Run it on its own task.
pub struct ProxyLoop {
    proxy: Arc<Proxy>,
    queue_rx: mpsc::UnboundedReceiver<ProxyMessage>,
}

impl ProxyLoop {
    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub async fn run(mut self) {
        let tick_ms = self.proxy.options().housekeeping_interval_ms.max(1);
        let mut tick = tokio::time::interval(Duration::from_millis(tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick of a tokio interval fires immediately
        tick.tick().await;

        loop {
            tokio::select! {
                message = self.queue_rx.recv() => {
                    match message {
                        Some(ProxyMessage::Request(request)) => {
                            self.proxy.dispatch_request(request);
                        }
                        Some(ProxyMessage::Finalize { request, ctx, reply }) => {
                            request.send_reply(reply);
                            drop(ctx);
                            drop(request);
                        }
                        Some(ProxyMessage::OldConfig(old)) => {
                            tracing::debug!(md5 = %old.md5(), "dropping superseded config");
                            drop(old);
                        }
                        Some(ProxyMessage::Shutdown) | None => break,
                    }
                }
                _ = tick.tick() => {
                    self.proxy.housekeeping();
                }
            }
        }

        self.sweep();
        tracing::debug!(worker = self.proxy.id(), "worker loop stopped");
    }

    /// Terminal drain: every request still queued or waiting gets a reply
    /// so no caller is left hanging.
    fn sweep(&mut self) {
        self.queue_rx.close();
        while let Ok(message) = self.queue_rx.try_recv() {
            match message {
                ProxyMessage::Request(request) => {
                    request.send_reply(Reply::local_error(
                        request.msg().op,
                        "worker shutting down",
                    ));
                }
                ProxyMessage::Finalize { request, reply, .. } => {
                    request.send_reply(reply);
                }
                ProxyMessage::OldConfig(_) | ProxyMessage::Shutdown => {}
            }
        }
        for request in self.proxy.drain_waiting() {
            self.proxy.stats.decr(Stat::ProxyReqsWaiting);
            request.send_reply(Reply::local_error(
                request.msg().op,
                "worker shutting down",
            ));
        }
    }
}
