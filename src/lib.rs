//! kuba-exec - sharded selector execution for vectorized PromQL
//!
//! This library provides the scan-and-fan-out layer of a step-vector query
//! engine:
//! - A per-query selector cache issuing one storage select per selector
//! - Instant and range selectors decoding disjoint shards of the series
//! - Concurrent and coalesce exchanges that parallelize and merge shards
//! - A pluggable `Queryable` storage seam with an in-memory backend

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Selector resolution, sharded selector operators and exchanges
pub mod query;

// Re-export main types
pub use config::Config;
pub use engine::{InMemoryStorage, Queryable, SelectHints};
pub use error::{Error, Result};
pub use query::{QueryOptions, Scanners};
pub use types::{Label, Labels, Sample};
