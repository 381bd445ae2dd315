//! Pool route: key-hash selection over a pool's clients, with an optional
//! shadow split.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::pool::pools::Pool;
use crate::pool::shadow::ShadowingPolicy;
use crate::routing::handle::{RequestCtx, RouteError, RouteHandle, RouteHandleRef};
use crate::worker::request::{McMsg, McOp, Reply};

pub struct PoolRoute {
    pool: Arc<Pool>,
    destinations: Vec<RouteHandleRef>,
    shadow: Option<ShadowSplit>,
}

struct ShadowSplit {
    policy: Arc<ShadowingPolicy>,
    target: RouteHandleRef,
}

impl PoolRoute {
    pub fn new(
        pool: Arc<Pool>,
        destinations: Vec<RouteHandleRef>,
        shadow: Option<(Arc<ShadowingPolicy>, RouteHandleRef)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            destinations,
            shadow: shadow.map(|(policy, target)| ShadowSplit { policy, target }),
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    fn pick(&self, key: &str) -> usize {
        crc32fast::hash(key.as_bytes()) as usize % self.destinations.len()
    }
}

impl RouteHandle for PoolRoute {
    fn route_name(&self) -> &'static str {
        "pool"
    }

    fn dispatch<'a>(
        &'a self,
        msg: &'a McMsg,
        ctx: &'a Arc<RequestCtx>,
    ) -> BoxFuture<'a, Result<Reply, RouteError>> {
        async move {
            if self.destinations.is_empty() {
                return Err(RouteError::EmptyPool(self.pool.name().to_string()));
            }
            let index = self.pick(&msg.key);

            if let Some(shadow) = &self.shadow {
                if shadow.policy.should_shadow(&msg.key, index) {
                    // Fire and forget: shadow replies and shadow failures
                    // never reach the primary reply.
                    let target = Arc::clone(&shadow.target);
                    let shadow_msg = msg.clone();
                    let shadow_ctx = Arc::clone(ctx);
                    tokio::spawn(async move {
                        if let Err(err) = target.dispatch(&shadow_msg, &shadow_ctx).await {
                            tracing::debug!(error = %err, "shadow dispatch failed");
                        }
                    });
                }
            }

            self.destinations[index].dispatch(msg, ctx).await
        }
        .boxed()
    }

    fn could_route_to(&self, msg: &McMsg, _op: McOp) -> Vec<RouteHandleRef> {
        if self.destinations.is_empty() {
            return Vec::new();
        }
        let mut children = vec![Arc::clone(&self.destinations[self.pick(&msg.key)])];
        if let Some(shadow) = &self.shadow {
            if shadow.policy.should_shadow(&msg.key, self.pick(&msg.key)) {
                children.push(Arc::clone(&shadow.target));
            }
        }
        children
    }
}
