#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for brook crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`BrookError`] / [`Result`] contracts
//! - hosts the per-node execution counters reported at plan shutdown
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Shared engine configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Per-node execution counters.
pub mod metrics;

pub use config::EngineConfig;
pub use error::{BrookError, Result};
pub use ids::NodeId;
pub use metrics::NodeMetrics;
