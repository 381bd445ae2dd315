//! Tree root: routing-prefix selection.
//!
//! The root inspects the request key for a `/region/cluster/` prefix and
//! hands the request to that prefix's pool route, falling back to the
//! default route. Unless the target pool keeps routing prefixes, the prefix
//! is stripped before the request goes further down.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::pool::client::BackendClient;
use crate::routing::handle::{RequestCtx, RouteError, RouteHandle, RouteHandleRef};
use crate::routing::pool_route::PoolRoute;
use crate::routing::prefix::{split_routing_key, RoutingPrefix};
use crate::worker::request::{McMsg, McOp, Reply};

pub struct ProxyRoute {
    routes: HashMap<String, Arc<PoolRoute>>,
    default_prefix: RoutingPrefix,
}

impl ProxyRoute {
    pub fn new(routes: HashMap<String, Arc<PoolRoute>>, default_prefix: RoutingPrefix) -> Arc<Self> {
        Arc::new(Self {
            routes,
            default_prefix,
        })
    }

    /// Resolve the pool route and the key to forward.
    fn select<'a>(&'a self, key: &'a str) -> Result<(&'a Arc<PoolRoute>, &'a str), RouteError> {
        let (prefix, bare_key) = split_routing_key(key);
        let prefix = prefix.unwrap_or_else(|| self.default_prefix.as_str());
        let route = self.routes.get(prefix).ok_or(RouteError::NoRoute)?;
        let forwarded = if route.pool().keep_routing_prefix() {
            key
        } else {
            bare_key
        };
        Ok((route, forwarded))
    }

    /// Every backend client a GET for `key` might touch, via recursive
    /// `could_route_to`. Runs in the caller's context against the snapshot
    /// the caller holds.
    pub fn foreach_possible_client(&self, key: &str, mut callback: impl FnMut(Arc<BackendClient>)) {
        fn walk(
            node: &RouteHandleRef,
            msg: &McMsg,
            callback: &mut dyn FnMut(Arc<BackendClient>),
        ) {
            if let Some(client) = node.client() {
                callback(client);
            }
            for child in node.could_route_to(msg, McOp::Get) {
                walk(&child, msg, callback);
            }
        }

        let msg = McMsg::get(key);
        for child in self.could_route_to(&msg, McOp::Get) {
            walk(&child, &msg, &mut callback);
        }
    }
}

impl RouteHandle for ProxyRoute {
    fn route_name(&self) -> &'static str {
        "proxy"
    }

    fn dispatch<'a>(
        &'a self,
        msg: &'a McMsg,
        ctx: &'a Arc<RequestCtx>,
    ) -> BoxFuture<'a, Result<Reply, RouteError>> {
        async move {
            let (route, key) = self.select(&msg.key)?;
            if key == msg.key {
                route.dispatch(msg, ctx).await
            } else {
                let stripped = msg.with_key(key);
                route.dispatch(&stripped, ctx).await
            }
        }
        .boxed()
    }

    fn could_route_to(&self, msg: &McMsg, op: McOp) -> Vec<RouteHandleRef> {
        match self.select(&msg.key) {
            Ok((route, key)) if key == msg.key => route.could_route_to(msg, op),
            Ok((route, key)) => route.could_route_to(&msg.with_key(key), op),
            Err(_) => Vec::new(),
        }
    }
}
