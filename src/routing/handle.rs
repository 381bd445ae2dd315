//! Route handle contract.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::config::snapshot::ConfigSnapshot;
use crate::pool::client::BackendClient;
use crate::worker::proxy::Proxy;
use crate::worker::request::{McMsg, McOp, Reply};

/// Dispatch failures. These are distinct from backend-observable errors,
/// which travel inside a [`Reply`]'s result code; a `RouteError` escaping to
/// the task boundary becomes a `local-error` reply.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route for key")]
    NoRoute,

    #[error("pool {0} has no clients")]
    EmptyPool(String),

    #[error("{0}")]
    Internal(String),
}

/// Per-request routing context. Captures the config snapshot the request
/// dispatches against; the snapshot stays pinned until the last holder
/// releases it.
pub struct RequestCtx {
    pub proxy: Arc<Proxy>,
    pub config: Arc<ConfigSnapshot>,
    pub sender_id: u64,
}

pub type RouteHandleRef = Arc<dyn RouteHandle>;

/// A node in the routing graph.
pub trait RouteHandle: Send + Sync {
    /// Node kind, for introspection output.
    fn route_name(&self) -> &'static str;

    /// Route the request and produce exactly one reply. Fanouts and
    /// failovers are collapsed by interior nodes.
    fn dispatch<'a>(
        &'a self,
        msg: &'a McMsg,
        ctx: &'a Arc<RequestCtx>,
    ) -> BoxFuture<'a, Result<Reply, RouteError>>;

    /// The children that might be selected for `msg` with operation `op`.
    /// Pure; used for client enumeration.
    fn could_route_to(&self, msg: &McMsg, op: McOp) -> Vec<RouteHandleRef>;

    /// The backend client this node sends to, if it is a leaf.
    fn client(&self) -> Option<Arc<BackendClient>> {
        None
    }
}
