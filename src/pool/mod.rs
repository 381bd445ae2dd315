//! Backend pools and clients.
//!
//! # Data Flow
//! ```text
//! config builder
//!     → table.rs (lookup_or_insert by client identity, reuse across reloads)
//!     → pools.rs (group clients, migration/failover parameters)
//!     → shadow.rs (per-pool shadowing policy, live-updated via runtime vars)
//!
//! route handle leaves
//!     → client.rs (TKO gate, transport send)
//! ```
//!
//! # Design Decisions
//! - A pool holds weak references to its clients; the table owns them
//! - A client's pool back-reference is tagged with the pool's identity so a
//!   stale pool teardown can never clear a reassigned client
//! - Clients surviving a reload keep their connections; the sweep reclaims
//!   the rest

pub mod client;
pub mod pools;
pub mod shadow;
pub mod table;

pub use client::{
    BackendClient, BackendTransport, ClientIdentity, ClientMonitor, Protocol, Transport,
    TransportError, TransportFactory,
};
pub use pools::{Pool, PoolKind};
pub use shadow::ShadowingPolicy;
pub use table::ClientTable;
