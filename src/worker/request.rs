//! Requests, replies, and the per-request context.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::stats::counters::Stat;
use crate::worker::proxy::Proxy;

/// Keys with this prefix turn a plain `get` into a service-info request.
pub const INTERNAL_GET_PREFIX: &str = "__mcrouter__.";

/// Memcache operation kinds the router understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McOp {
    Get,
    Set,
    Add,
    Replace,
    Delete,
    Incr,
    Decr,
    Metaget,
    LeaseGet,
    LeaseSet,
    Stats,
    Version,
    GetServiceInfo,
    Other,
}

impl McOp {
    /// Operations exempt from the admission gate.
    pub fn is_bypass(self) -> bool {
        matches!(self, McOp::Stats | McOp::Version | McOp::GetServiceInfo)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            McOp::Get => "get",
            McOp::Set => "set",
            McOp::Add => "add",
            McOp::Replace => "replace",
            McOp::Delete => "delete",
            McOp::Incr => "incr",
            McOp::Decr => "decr",
            McOp::Metaget => "metaget",
            McOp::LeaseGet => "lease-get",
            McOp::LeaseSet => "lease-set",
            McOp::Stats => "stats",
            McOp::Version => "version",
            McOp::GetServiceInfo => "get-service-info",
            McOp::Other => "other",
        }
    }
}

impl FromStr for McOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "get" => McOp::Get,
            "set" => McOp::Set,
            "add" => McOp::Add,
            "replace" => McOp::Replace,
            "delete" => McOp::Delete,
            "incr" => McOp::Incr,
            "decr" => McOp::Decr,
            "metaget" => McOp::Metaget,
            "lease-get" => McOp::LeaseGet,
            "lease-set" => McOp::LeaseSet,
            "stats" => McOp::Stats,
            "version" => McOp::Version,
            "get-service-info" => McOp::GetServiceInfo,
            _ => return Err(()),
        })
    }
}

impl std::fmt::Display for McOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McResult {
    Ok,
    Found,
    NotFound,
    Stored,
    NotStored,
    Exists,
    Deleted,
    Busy,
    Tko,
    Timeout,
    ConnectTimeout,
    ConnectError,
    RemoteError,
    LocalError,
}

impl McResult {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            McResult::Busy
                | McResult::Tko
                | McResult::Timeout
                | McResult::ConnectTimeout
                | McResult::ConnectError
                | McResult::RemoteError
                | McResult::LocalError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            McResult::Ok => "ok",
            McResult::Found => "found",
            McResult::NotFound => "notfound",
            McResult::Stored => "stored",
            McResult::NotStored => "notstored",
            McResult::Exists => "exists",
            McResult::Deleted => "deleted",
            McResult::Busy => "busy",
            McResult::Tko => "tko",
            McResult::Timeout => "timeout",
            McResult::ConnectTimeout => "connect_timeout",
            McResult::ConnectError => "connect_error",
            McResult::RemoteError => "remote_error",
            McResult::LocalError => "local_error",
        }
    }
}

impl std::fmt::Display for McResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed memcache request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McMsg {
    pub op: McOp,
    pub key: String,
    pub value: Vec<u8>,
    pub flags: u64,
    pub exptime: u32,
    pub cas: u64,
}

impl McMsg {
    pub fn new(op: McOp, key: impl Into<String>) -> Self {
        Self {
            op,
            key: key.into(),
            value: Vec::new(),
            flags: 0,
            exptime: 0,
            cas: 0,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(McOp::Get, key)
    }

    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let mut msg = Self::new(McOp::Set, key);
        msg.value = value.into();
        msg
    }

    /// Copy of this message with a different key. Used when the routing
    /// prefix is stripped before forwarding.
    pub fn with_key(&self, key: &str) -> Self {
        let mut msg = self.clone();
        msg.key = key.to_string();
        msg
    }

    /// Wire-level validity: key length and character set. Operations that
    /// carry no key (stats, version) pass with an empty key.
    pub fn is_valid(&self) -> bool {
        const MAX_KEY_LEN: usize = 250;
        if self.key.len() > MAX_KEY_LEN {
            return false;
        }
        if self.key.bytes().any(|b| b <= b' ' || b == 0x7f) {
            return false;
        }
        match self.op {
            McOp::Stats | McOp::Version => true,
            _ => !self.key.is_empty(),
        }
    }
}

/// A reply. `op` echoes the client-visible operation, not any internal
/// rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub op: McOp,
    pub result: McResult,
    pub value: Vec<u8>,
}

impl Reply {
    pub fn new(op: McOp, result: McResult) -> Self {
        Self {
            op,
            result,
            value: Vec::new(),
        }
    }

    pub fn with_value(op: McOp, result: McResult, value: Vec<u8>) -> Self {
        Self { op, result, value }
    }

    pub fn local_error(op: McOp, message: impl Into<String>) -> Self {
        Self::with_value(op, McResult::LocalError, message.into().into_bytes())
    }

    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Delivered exactly once per submitted request.
pub type ReplyCallback = Box<dyn FnOnce(Reply) + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("invalid request")]
    InvalidRequest,

    #[error("worker is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    NoReply,
    Delayed,
    Replied,
}

struct ReplySlot {
    reply: Option<Reply>,
    state: ReplyState,
    delay: u32,
    callback: Option<ReplyCallback>,
}

/// Per-request state owned by the pipeline. Wrapped in `Arc`; the last
/// holder's drop finalizes pipeline gauges and, in sync mode, enqueues the
/// reply.
pub struct ProxyRequest {
    proxy: Arc<Proxy>,
    msg: McMsg,
    /// Operation the client sent, echoed on the way out even when the
    /// request was rewritten internally.
    client_op: McOp,
    sender_id: u64,
    processing: AtomicBool,
    slot: Mutex<ReplySlot>,
}

impl ProxyRequest {
    pub(crate) fn new(
        proxy: Arc<Proxy>,
        msg: McMsg,
        sender_id: u64,
        callback: ReplyCallback,
    ) -> Result<Arc<Self>, SubmitError> {
        if !msg.is_valid() {
            return Err(SubmitError::InvalidRequest);
        }

        let client_op = msg.op;
        let mut msg = msg;
        if msg.op == McOp::Get && msg.key.starts_with(INTERNAL_GET_PREFIX) {
            // backwards compatibility: (get, "__mcrouter__.key") is really
            // (get-service-info, "key"); the reply op is restored on egress
            msg.op = McOp::GetServiceInfo;
            msg.key = msg.key[INTERNAL_GET_PREFIX.len()..].to_string();
        }

        proxy.stats().incr(Stat::ProxyRequestNumOutstanding);

        Ok(Arc::new(Self {
            proxy,
            msg,
            client_op,
            sender_id,
            processing: AtomicBool::new(false),
            slot: Mutex::new(ReplySlot {
                reply: None,
                state: ReplyState::NoReply,
                delay: 0,
                callback: Some(callback),
            }),
        }))
    }

    pub fn msg(&self) -> &McMsg {
        &self.msg
    }

    pub fn client_op(&self) -> McOp {
        self.client_op
    }

    pub fn sender_id(&self) -> u64 {
        self.sender_id
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub(crate) fn begin_processing(&self) {
        let was = self.processing.swap(true, Ordering::Relaxed);
        debug_assert!(!was, "request processed twice");
    }

    pub fn reply_state(&self) -> ReplyState {
        self.slot.lock().expect("reply slot poisoned").state
    }

    pub fn reply(&self) -> Option<Reply> {
        self.slot.lock().expect("reply slot poisoned").reply.clone()
    }

    /// Hold the reply back until [`release_delayed_reply`] balances this
    /// call. Used by side channels that must settle before the client sees
    /// the reply.
    ///
    /// [`release_delayed_reply`]: Self::release_delayed_reply
    pub fn delay_reply(&self) {
        self.slot.lock().expect("reply slot poisoned").delay += 1;
    }

    pub fn release_delayed_reply(&self) {
        let to_invoke = {
            let mut slot = self.slot.lock().expect("reply slot poisoned");
            debug_assert!(slot.delay > 0);
            slot.delay = slot.delay.saturating_sub(1);
            if slot.delay == 0 && slot.state == ReplyState::Delayed {
                self.finish_reply(&mut slot)
            } else {
                None
            }
        };
        if let Some((callback, reply)) = to_invoke {
            callback(reply);
        }
    }

    /// Record the reply. The first call wins; later calls are ignored. The
    /// outbound op is forced back to the client-visible one.
    pub fn send_reply(&self, mut reply: Reply) {
        let to_invoke = {
            let mut slot = self.slot.lock().expect("reply slot poisoned");
            if slot.reply.is_some() {
                tracing::debug!(key = %self.msg.key, "duplicate reply ignored");
                return;
            }

            reply.op = self.client_op;
            slot.reply = Some(reply);

            if slot.state != ReplyState::NoReply {
                return;
            }
            if slot.delay == 0 {
                self.finish_reply(&mut slot)
            } else {
                slot.state = ReplyState::Delayed;
                None
            }
        };
        if let Some((callback, reply)) = to_invoke {
            callback(reply);
        }
    }

    /// Transition to `Replied`, update reply counters, and hand back the
    /// callback for invocation outside the lock. In sync mode the callback
    /// stays put until the request context is destroyed.
    fn finish_reply(&self, slot: &mut ReplySlot) -> Option<(ReplyCallback, Reply)> {
        slot.state = ReplyState::Replied;

        let stats = self.proxy.stats();
        stats.incr(Stat::RequestReplied);
        stats.incr(Stat::RequestRepliedCount);
        let result = slot
            .reply
            .as_ref()
            .map(|r| r.result)
            .unwrap_or(McResult::LocalError);
        if result.is_error() {
            stats.incr(Stat::RequestError);
            stats.incr(Stat::RequestErrorCount);
        } else {
            stats.incr(Stat::RequestSuccess);
            stats.incr(Stat::RequestSuccessCount);
        }
        crate::observability::metrics::record_reply(self.client_op.as_str(), result.as_str());

        if self.proxy.options().sync {
            return None;
        }
        let callback = slot.callback.take()?;
        let reply = slot.reply.clone()?;
        Some((callback, reply))
    }
}

impl Drop for ProxyRequest {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().expect("reply slot poisoned");

        // sync mode: the reply is enqueued only now, once every side
        // channel referencing this context has settled
        if self.proxy.options().sync && slot.state == ReplyState::Replied {
            if let (Some(callback), Some(reply)) = (slot.callback.take(), slot.reply.clone()) {
                callback(reply);
            }
        }

        if self.processing.load(Ordering::Relaxed) {
            self.proxy.note_request_done();
        }

        self.proxy.stats().decr(Stat::ProxyRequestNumOutstanding);
    }
}

impl std::fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("op", &self.msg.op)
            .field("key", &self.msg.key)
            .field("state", &self.reply_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validity() {
        assert!(McMsg::get("user:17").is_valid());
        assert!(!McMsg::get("has space").is_valid());
        assert!(!McMsg::get("ctrl\x01char").is_valid());
        assert!(!McMsg::get("x".repeat(251)).is_valid());
        assert!(!McMsg::get("").is_valid());
        assert!(McMsg::new(McOp::Stats, "").is_valid());
        assert!(McMsg::new(McOp::Version, "").is_valid());
    }

    #[test]
    fn op_round_trips_through_str() {
        for op in [McOp::Get, McOp::LeaseSet, McOp::GetServiceInfo] {
            assert_eq!(op.as_str().parse::<McOp>().unwrap(), op);
        }
        assert!("nope".parse::<McOp>().is_err());
    }

    #[test]
    fn error_results_are_errors() {
        assert!(McResult::LocalError.is_error());
        assert!(McResult::Tko.is_error());
        assert!(!McResult::NotFound.is_error());
        assert!(!McResult::Stored.is_error());
    }

    mod pipeline {
        use super::*;
        use crate::config::schema::RouterOptions;
        use std::sync::atomic::AtomicUsize;

        fn test_proxy(options: RouterOptions) -> Arc<Proxy> {
            // the loop is not driven: these tests never post to the queue
            let (proxy, _loop) = Proxy::new(0, options);
            proxy
        }

        fn counting_callback() -> (ReplyCallback, Arc<Mutex<Vec<Reply>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen2 = Arc::clone(&seen);
            (
                Box::new(move |reply| seen2.lock().unwrap().push(reply)),
                seen,
            )
        }

        #[test]
        fn internal_get_is_rewritten_and_restored() {
            let proxy = test_proxy(RouterOptions::default());
            let (callback, seen) = counting_callback();
            let request = ProxyRequest::new(
                Arc::clone(&proxy),
                McMsg::get("__mcrouter__.version"),
                0,
                callback,
            )
            .unwrap();

            assert_eq!(request.msg().op, McOp::GetServiceInfo);
            assert_eq!(request.msg().key, "version");
            assert_eq!(request.client_op(), McOp::Get);

            request.send_reply(Reply::with_value(
                McOp::GetServiceInfo,
                McResult::Ok,
                b"1.0".to_vec(),
            ));
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            // the rewrite is invisible on the way out
            assert_eq!(seen[0].op, McOp::Get);
            assert_eq!(seen[0].result, McResult::Ok);
        }

        #[test]
        fn reply_fires_exactly_once() {
            let proxy = test_proxy(RouterOptions::default());
            let count = Arc::new(AtomicUsize::new(0));
            let count2 = Arc::clone(&count);
            let request = ProxyRequest::new(
                Arc::clone(&proxy),
                McMsg::get("k"),
                0,
                Box::new(move |_| {
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

            request.send_reply(Reply::new(McOp::Get, McResult::NotFound));
            request.send_reply(Reply::new(McOp::Get, McResult::Found));
            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert_eq!(request.reply().unwrap().result, McResult::NotFound);
        }

        #[test]
        fn delayed_reply_is_held_until_released() {
            let proxy = test_proxy(RouterOptions::default());
            let (callback, seen) = counting_callback();
            let request =
                ProxyRequest::new(Arc::clone(&proxy), McMsg::get("k"), 0, callback).unwrap();

            request.delay_reply();
            request.send_reply(Reply::new(McOp::Get, McResult::Found));
            assert_eq!(request.reply_state(), ReplyState::Delayed);
            assert!(seen.lock().unwrap().is_empty());

            request.release_delayed_reply();
            assert_eq!(request.reply_state(), ReplyState::Replied);
            assert_eq!(seen.lock().unwrap().len(), 1);
        }

        #[test]
        fn sync_mode_defers_enqueue_to_destruction() {
            let mut options = RouterOptions::default();
            options.sync = true;
            let proxy = test_proxy(options);
            let (callback, seen) = counting_callback();
            let request =
                ProxyRequest::new(Arc::clone(&proxy), McMsg::get("k"), 0, callback).unwrap();

            request.send_reply(Reply::new(McOp::Get, McResult::Found));
            assert_eq!(request.reply_state(), ReplyState::Replied);
            assert!(seen.lock().unwrap().is_empty());

            drop(request);
            assert_eq!(seen.lock().unwrap().len(), 1);
        }

        #[test]
        fn outstanding_gauge_balances() {
            let proxy = test_proxy(RouterOptions::default());
            let (callback, _seen) = counting_callback();
            let request =
                ProxyRequest::new(Arc::clone(&proxy), McMsg::get("k"), 0, callback).unwrap();
            assert_eq!(proxy.stats().get(Stat::ProxyRequestNumOutstanding), 1);
            request.send_reply(Reply::new(McOp::Get, McResult::Found));
            drop(request);
            assert_eq!(proxy.stats().get(Stat::ProxyRequestNumOutstanding), 0);
        }
    }
}
