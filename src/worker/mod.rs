//! The worker: request pipeline and event loop.
//!
//! # Data Flow
//! ```text
//! transport thread
//!     → Proxy::submit (validate, rewrite, enqueue)   [any thread]
//!     → ProxyLoop (drain queue)                      [worker thread]
//!     → admission gate (bypass / process / wait)
//!     → request task (route tree dispatch)
//!     → finalize on the loop (send reply, drop request context)
//! ```
//!
//! # Design Decisions
//! - One reply per request, enforced by the request's reply slot
//! - Heavy teardown (stale snapshots, request contexts) always runs on the
//!   worker loop, never inside a request task
//! - `stats`, `version`, and `get_service_info` are answered on the loop
//!   and never rate limited

pub mod proxy;
pub mod request;
pub mod service_info;

pub use proxy::{Proxy, ProxyLoop};
pub use request::{McMsg, McOp, McResult, Reply, SubmitError};
