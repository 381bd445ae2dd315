//! Introspection: the `stats` and `get-service-info` operations.
//!
//! Both are served on the worker loop without touching the dispatch path.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::routing::handle::{RequestCtx, RouteError};
use crate::worker::proxy::Proxy;
use crate::worker::request::{McOp, McResult, Reply};

pub fn version_string() -> String {
    format!("memroute-{}", env!("CARGO_PKG_VERSION"))
}

/// Answer a `stats` request from the worker's counter block.
pub fn stats_reply(proxy: &Proxy, _key: &str) -> Reply {
    let mut out = String::new();
    for (name, value) in proxy.stats().snapshot() {
        let _ = writeln!(out, "STAT {name} {value}\r");
    }
    out.push_str("END\r\n");
    Reply::with_value(McOp::Stats, McResult::Ok, out.into_bytes())
}

/// Answers `get-service-info` requests against one config snapshot.
#[derive(Debug, Default)]
pub struct ServiceInfo;

impl ServiceInfo {
    pub fn new() -> Self {
        Self
    }

    /// `key` is the command string, e.g. `config_md5` or
    /// `route(get,/region/cluster/foo)`. Keys cannot carry spaces, so
    /// arguments travel in parentheses.
    pub fn handle_request(
        &self,
        ctx: &Arc<RequestCtx>,
        key: &str,
    ) -> Result<Reply, RouteError> {
        let (command, args) = match key.split_once('(') {
            Some((command, rest)) => {
                let args = rest.strip_suffix(')').ok_or_else(|| {
                    RouteError::Internal(format!("malformed service info key '{key}'"))
                })?;
                (command, Some(args))
            }
            None => (key, None),
        };

        let value = match command {
            "config_md5" => ctx.config.md5().to_string(),
            "config_age" => ctx.config.age_secs().to_string(),
            "version" => version_string(),
            "hostid" => ctx.proxy.host_id().to_string(),
            "pools" => {
                let mut names: Vec<&str> =
                    ctx.config.pools().keys().map(String::as_str).collect();
                names.sort_unstable();
                names.join("\r\n")
            }
            "route" => {
                let (op, key) = args
                    .and_then(|a| a.split_once(','))
                    .ok_or_else(|| RouteError::Internal("route: expected (op,key)".into()))?;
                op.parse::<McOp>()
                    .map_err(|_| RouteError::Internal(format!("route: unknown op '{op}'")))?;

                let mut out = Vec::new();
                ctx.config
                    .proxy_route()
                    .foreach_possible_client(key, |client| {
                        out.push(client.identity().to_string());
                    });
                out.join("\r\n")
            }
            other => {
                return Err(RouteError::Internal(format!(
                    "unknown service info command '{other}'"
                )))
            }
        };

        Ok(Reply::with_value(
            McOp::GetServiceInfo,
            McResult::Ok,
            value.into_bytes(),
        ))
    }
}
