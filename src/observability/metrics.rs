//! Metrics collection and exposition.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize the Prometheus exporter and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("metrics server listening on http://{}", addr);
}

/// Record a delivered reply.
pub fn record_reply(op: &str, result: &str) {
    let labels = [("op", op.to_string()), ("result", result.to_string())];
    counter!("router_replies_total", &labels).increment(1);
}

/// Record a request parked by the admission gate.
pub fn record_rate_gated() {
    counter!("router_requests_rate_gated_total").increment(1);
}

/// Record the outcome of a reconfiguration attempt.
pub fn record_config_reload(success: bool) {
    let labels = [(
        "outcome",
        if success { "success" } else { "failure" }.to_string(),
    )];
    counter!("router_config_reloads_total", &labels).increment(1);
}

/// Update the per-worker server-count gauge.
pub fn set_num_servers(worker: usize, servers: u64) {
    gauge!("router_num_servers", "worker" => worker.to_string()).set(servers as f64);
}
