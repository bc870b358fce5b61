//! Exchange operators - fan-out and fan-in between shards
//!
//! - [`Concurrent`]: moves one operator onto its own task behind a bounded
//!   buffer so shards decode in parallel
//! - [`Coalesce`]: merges step-aligned shard streams into a single stream
//!   with one contiguous series id space

pub mod coalesce;
pub mod concurrent;

#[cfg(test)]
pub(crate) mod testing;

pub use coalesce::Coalesce;
pub use concurrent::Concurrent;
