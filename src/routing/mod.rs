//! Route handle tree.
//!
//! # Data Flow
//! ```text
//! request (key, op)
//!     → proxy_route.rs (routing-prefix selection, the tree root)
//!     → pool_route.rs (key-hash client selection, shadow split)
//!     → destination.rs (TKO gate, transport send, RTT sample)
//!     → Reply
//! ```
//!
//! # Design Decisions
//! - The tree is built by the config builder and immutable for a snapshot's
//!   lifetime; dispatch never takes locks on the tree itself
//! - `could_route_to` is pure introspection and mirrors dispatch's choices
//! - Shadow sends are side effects; their replies are discarded

pub mod destination;
pub mod handle;
pub mod pool_route;
pub mod prefix;
pub mod proxy_route;

pub use handle::{RequestCtx, RouteError, RouteHandle, RouteHandleRef};
pub use prefix::RoutingPrefix;
pub use proxy_route::ProxyRoute;
