//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config blob (JSON, from file or control plane)
//!     → schema.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → builder.rs (pools, clients, route tree, md5)
//!     → snapshot.rs (immutable ConfigSnapshot behind a reader/writer cell)
//!
//! On reload:
//!     reloader.rs takes the process-wide reconfig lock
//!     → marks every worker's clients unused
//!     → builds one snapshot per worker (all-or-nothing)
//!     → swaps each worker's cell
//!     → posts the old snapshot to that worker's queue for teardown
//! ```
//!
//! # Design Decisions
//! - A snapshot is immutable once built; readers clone a handle in O(1) and
//!   keep it for the duration of their task
//! - A failed build swaps nothing anywhere
//! - Old snapshots are destroyed on the owning worker's loop, never on a
//!   request task

pub mod builder;
pub mod reloader;
pub mod schema;
pub mod snapshot;
pub mod validation;

use thiserror::Error;

pub use reloader::Router;
pub use schema::{RouterOptions, RoutingConfig};
pub use snapshot::{ConfigCell, ConfigSnapshot};
pub use validation::ValidationError;

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error type for configuration loading, building, and reloading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Logic(String),

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("empty default route")]
    EmptyDefaultRoute,
}
