//! Pipeline tests: admission gating, bypass operations, reply delivery, and
//! the task error boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memroute::pool::client::{BackendClient, ClientMonitor, TransportError};
use memroute::stats::counters::Stat;
use memroute::worker::request::{McMsg, McOp, McResult, Reply, SubmitError};

mod common;
use common::*;

#[tokio::test]
async fn rate_gate_admits_two_queues_third_fifo() {
    let gated = GatedTransport::new();
    let mut options = default_options();
    options.proxy_max_inflight_requests = 2;

    let (router, proxy, _loop) = start_router(
        options,
        Arc::new(SharedFactory(Arc::clone(&gated) as _)),
    );
    router.configure(SINGLE_POOL_BLOB).unwrap();

    let reply_a = submit(&proxy, McMsg::get("a"));
    let reply_b = submit(&proxy, McMsg::get("b"));
    let reply_c = submit(&proxy, McMsg::get("c"));

    // a and b go straight to processing; c waits
    gated.wait_for_pending(2).await;
    wait_until(|| proxy.num_requests_waiting() == 1).await;
    assert_eq!(proxy.num_requests_processing(), 2);
    assert_eq!(proxy.stats().get(Stat::ProxyReqsProcessing), 2);
    assert_eq!(proxy.stats().get(Stat::ProxyReqsWaiting), 1);
    assert_eq!(proxy.stats().get(Stat::ProxyRequestNumOutstanding), 3);

    // completing a promotes c, in order
    gated.release_next();
    let reply = reply_a.await.unwrap();
    assert_eq!(reply.result, McResult::Found);
    assert_eq!(reply.value, b"a");

    gated.wait_for_pending(2).await;
    wait_until(|| proxy.num_requests_waiting() == 0).await;
    assert_eq!(gated.arrival_order(), vec!["a", "b", "c"]);

    gated.release_all();
    assert_eq!(reply_b.await.unwrap().value, b"b");
    assert_eq!(reply_c.await.unwrap().value, b"c");

    // quiescent: every gauge back to zero
    wait_until(|| proxy.stats().get(Stat::ProxyRequestNumOutstanding) == 0).await;
    assert_eq!(proxy.stats().get(Stat::ProxyReqsProcessing), 0);
    assert_eq!(proxy.stats().get(Stat::ProxyReqsWaiting), 0);
}

#[tokio::test]
async fn bypass_ops_overtake_a_full_gate() {
    let gated = GatedTransport::new();
    let mut options = default_options();
    options.proxy_max_inflight_requests = 1;

    let (router, proxy, _loop) = start_router(
        options,
        Arc::new(SharedFactory(Arc::clone(&gated) as _)),
    );
    router.configure(SINGLE_POOL_BLOB).unwrap();

    let gated_get = submit(&proxy, McMsg::get("g1"));
    let waiting_get = submit(&proxy, McMsg::get("g2"));
    gated.wait_for_pending(1).await;
    wait_until(|| proxy.num_requests_waiting() == 1).await;

    // stats and version answer immediately despite the full gate
    let stats_reply = submit(&proxy, McMsg::new(McOp::Stats, "")).await.unwrap();
    assert_eq!(stats_reply.result, McResult::Ok);
    let body = stats_reply.value_str().into_owned();
    assert!(body.contains("cmd_get_stat"));
    assert!(body.contains("proxy_reqs_waiting_stat 1"));

    let version_reply = submit(&proxy, McMsg::new(McOp::Version, "")).await.unwrap();
    assert_eq!(version_reply.result, McResult::Ok);
    assert!(version_reply.value_str().starts_with("memroute-"));

    gated.release_all();
    gated_get.await.unwrap();
    gated.wait_for_pending(1).await;
    gated.release_all();
    waiting_get.await.unwrap();
}

#[tokio::test]
async fn disabled_gate_processes_everything_at_once() {
    let gated = GatedTransport::new();
    let mut options = default_options();
    options.proxy_max_inflight_requests = 0;

    let (router, proxy, _loop) = start_router(
        options,
        Arc::new(SharedFactory(Arc::clone(&gated) as _)),
    );
    router.configure(SINGLE_POOL_BLOB).unwrap();

    let replies: Vec<_> = (0..16)
        .map(|i| submit(&proxy, McMsg::get(format!("k{i}"))))
        .collect();
    gated.wait_for_pending(16).await;
    assert_eq!(proxy.num_requests_waiting(), 0);
    assert_eq!(proxy.num_requests_processing(), 16);

    gated.release_all();
    for reply in replies {
        assert_eq!(reply.await.unwrap().result, McResult::Found);
    }
}

#[tokio::test]
async fn dispatch_failure_becomes_local_error_reply() {
    let (router, proxy, _loop) = start_router(
        default_options(),
        Arc::new(SharedFactory(Arc::new(FailTransport {
            error: || TransportError::Internal("boom".to_string()),
        }))),
    );
    router.configure(SINGLE_POOL_BLOB).unwrap();

    let reply = submit(&proxy, McMsg::get("k")).await.unwrap();
    assert_eq!(reply.op, McOp::Get);
    assert_eq!(reply.result, McResult::LocalError);
    let body = reply.value_str().into_owned();
    assert!(body.contains("k"), "body was {body:?}");
    assert!(body.contains("boom"), "body was {body:?}");

    wait_until(|| proxy.stats().get(Stat::ProxyReqsProcessing) == 0).await;
    assert_eq!(proxy.stats().get(Stat::RequestError), 1);
    assert_eq!(proxy.stats().get(Stat::RequestReplied), 1);
}

#[tokio::test]
async fn backend_errors_surface_in_the_result_code() {
    let (router, proxy, _loop) = start_router(
        default_options(),
        Arc::new(SharedFactory(Arc::new(FailTransport {
            error: || TransportError::Connect("refused".to_string()),
        }))),
    );
    router.configure(SINGLE_POOL_BLOB).unwrap();

    let reply = submit(&proxy, McMsg::get("k")).await.unwrap();
    assert_eq!(reply.result, McResult::ConnectError);
}

#[tokio::test]
async fn invalid_request_rejected_synchronously() {
    let (router, proxy, _loop) =
        start_router(default_options(), Arc::new(SharedFactory(Arc::new(EchoTransport))));
    router.configure(SINGLE_POOL_BLOB).unwrap();

    let err = proxy
        .submit(McMsg::get("bad key"), 0, Box::new(|_| {}))
        .unwrap_err();
    assert_eq!(err, SubmitError::InvalidRequest);
    assert_eq!(proxy.stats().get(Stat::ProxyRequestNumOutstanding), 0);
}

#[tokio::test]
async fn op_counters_track_operations() {
    let (router, proxy, _loop) =
        start_router(default_options(), Arc::new(SharedFactory(Arc::new(EchoTransport))));
    router.configure(SINGLE_POOL_BLOB).unwrap();

    assert_eq!(submit(&proxy, McMsg::get("k")).await.unwrap().result, McResult::Found);
    assert_eq!(
        submit(&proxy, McMsg::set("k", b"v".to_vec())).await.unwrap().result,
        McResult::Stored
    );
    assert_eq!(
        submit(&proxy, McMsg::new(McOp::Delete, "k")).await.unwrap().result,
        McResult::Deleted
    );

    assert_eq!(proxy.stats().get(Stat::CmdGet), 1);
    assert_eq!(proxy.stats().get(Stat::CmdGetCount), 1);
    assert_eq!(proxy.stats().get(Stat::CmdSet), 1);
    assert_eq!(proxy.stats().get(Stat::CmdDelete), 1);
    assert_eq!(proxy.stats().get(Stat::RequestSent), 3);
    wait_until(|| proxy.stats().get(Stat::RequestSuccess) == 3).await;
}

#[tokio::test]
async fn monitor_observes_and_can_veto_sends() {
    #[derive(Default)]
    struct RecordingMonitor {
        responses: AtomicUsize,
        veto: std::sync::atomic::AtomicBool,
    }

    impl ClientMonitor for RecordingMonitor {
        fn may_send(&self, _client: &BackendClient, _msg: &McMsg) -> bool {
            !self.veto.load(Ordering::SeqCst)
        }

        fn on_response(&self, _client: &BackendClient, _reply: &Reply) {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (router, proxy, _loop) =
        start_router(default_options(), Arc::new(SharedFactory(Arc::new(EchoTransport))));
    router.configure(SINGLE_POOL_BLOB).unwrap();

    let monitor = Arc::new(RecordingMonitor::default());
    proxy.set_monitor(Some(Arc::clone(&monitor) as _));

    assert_eq!(submit(&proxy, McMsg::get("k")).await.unwrap().result, McResult::Found);
    assert_eq!(monitor.responses.load(Ordering::SeqCst), 1);

    monitor.veto.store(true, Ordering::SeqCst);
    let reply = submit(&proxy, McMsg::get("k")).await.unwrap();
    assert_eq!(reply.result, McResult::Tko);
    assert_eq!(monitor.responses.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_sweeps_pending_requests_with_replies() {
    let gated = GatedTransport::new();
    let mut options = default_options();
    options.proxy_max_inflight_requests = 1;

    let (router, proxy, loop_handle) = start_router(
        options,
        Arc::new(SharedFactory(Arc::clone(&gated) as _)),
    );
    router.configure(SINGLE_POOL_BLOB).unwrap();

    let _inflight = submit(&proxy, McMsg::get("a"));
    let parked = submit(&proxy, McMsg::get("b"));
    gated.wait_for_pending(1).await;
    wait_until(|| proxy.num_requests_waiting() == 1).await;

    router.shutdown();
    loop_handle.await.unwrap();

    // the parked request was never processed but still got its reply
    let reply = parked.await.unwrap();
    assert_eq!(reply.result, McResult::LocalError);

    let err = proxy
        .submit(McMsg::get("late"), 0, Box::new(|_| {}))
        .unwrap_err();
    assert_eq!(err, SubmitError::ShuttingDown);
}
