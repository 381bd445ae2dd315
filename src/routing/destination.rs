//! Leaf route handle: one backend client.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::pool::client::{BackendClient, TransportError};
use crate::routing::handle::{RequestCtx, RouteError, RouteHandle, RouteHandleRef};
use crate::worker::request::{McMsg, McOp, McResult, Reply};

pub struct DestinationRoute {
    client: Arc<BackendClient>,
}

impl DestinationRoute {
    pub fn new(client: Arc<BackendClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

impl RouteHandle for DestinationRoute {
    fn route_name(&self) -> &'static str {
        "destination"
    }

    fn dispatch<'a>(
        &'a self,
        msg: &'a McMsg,
        ctx: &'a Arc<RequestCtx>,
    ) -> BoxFuture<'a, Result<Reply, RouteError>> {
        async move {
            if self.client.is_tko() {
                return Ok(Reply::new(msg.op, McResult::Tko));
            }

            let monitor = ctx.proxy.monitor();
            if let Some(monitor) = &monitor {
                if !monitor.may_send(&self.client, msg) {
                    return Ok(Reply::new(msg.op, McResult::Tko));
                }
            }

            self.client.touch();
            let started = Instant::now();
            let sent = self.client.transport().send(msg).await;
            ctx.proxy
                .rtt_timer()
                .insert_sample_us(started.elapsed().as_micros() as u64);

            match sent {
                Ok(reply) => {
                    self.client.note_success();
                    if let Some(monitor) = &monitor {
                        monitor.on_response(&self.client, &reply);
                    }
                    Ok(reply)
                }
                Err(TransportError::Internal(err)) => Err(RouteError::Internal(err)),
                Err(err) => {
                    if self.client.note_failure() {
                        if let Some(monitor) = &monitor {
                            monitor.on_down(&self.client);
                        }
                    }
                    let result = match &err {
                        TransportError::Connect(_) => McResult::ConnectError,
                        TransportError::ConnectTimeout => McResult::ConnectTimeout,
                        TransportError::Timeout => McResult::Timeout,
                        TransportError::Remote(_) => McResult::RemoteError,
                        TransportError::Internal(_) => unreachable!(),
                    };
                    tracing::debug!(
                        client = %self.client.identity(),
                        error = %err,
                        "backend send failed"
                    );
                    Ok(Reply::with_value(msg.op, result, err.to_string().into_bytes()))
                }
            }
        }
        .boxed()
    }

    fn could_route_to(&self, _msg: &McMsg, _op: McOp) -> Vec<RouteHandleRef> {
        Vec::new()
    }

    fn client(&self) -> Option<Arc<BackendClient>> {
        Some(Arc::clone(&self.client))
    }
}
