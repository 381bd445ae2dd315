//! Worker statistics.
//!
//! # Data Flow
//! ```text
//! pipeline / route handles
//!     → counters.rs (lock-free per-worker counter block)
//!     → rtt.rs (smoothed round-trip accounting)
//!     → flushed into gauges by the worker's housekeeping tick
//!     → read out by the `stats` operation
//! ```
//!
//! # Design Decisions
//! - Each worker owns its counter block; writers never contend
//! - Counter names are a wire contract, not an implementation detail
//! - Cross-worker aggregation is the reader's problem, best-effort

pub mod counters;
pub mod rtt;

pub use counters::{ProxyStats, Stat};
pub use rtt::{ExponentialSmoothing, RttTimer};
