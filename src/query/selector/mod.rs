//! Series selectors - resolved, cached, and sharded series sets
//!
//! A selector is a lazily resolved handle over the series that match a
//! matcher set within a time range. It is resolved at most once and then
//! shared read-only by every shard of every operator that uses it.
//!
//! # Sharding
//!
//! The series at global ordinal `i` belongs to shard `i % num_shards`.
//! Within its shard a series is identified by its *signature*, its position
//! in that shard, which is also the sample id the shard's operator emits.
//!
//! ```text
//! ordinal:   0  1  2  3  4  5  6
//! shard 0:   0        1        2      (signatures)
//! shard 1:      0        1
//! shard 2:         0        1
//! ```

pub mod filtered;
pub mod pool;

pub use filtered::FilteredSelector;
pub use pool::{SelectorPool, SelectorPoolStats, SeriesSelectorImpl};

use crate::error::StorageError;
use crate::query::ast::LabelMatcher;
use crate::query::error::QueryResult;
use crate::types::{Labels, Sample};
use async_trait::async_trait;
use std::sync::Arc;

/// A fully materialized series shared between shards
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSeries {
    /// Label set of the series
    pub labels: Labels,
    /// Samples sorted by timestamp
    pub samples: Arc<[Sample]>,
}

/// A series assigned to a shard
#[derive(Debug, Clone, PartialEq)]
pub struct SignedSeries {
    /// Position within the shard; the sample id emitted for this series
    pub signature: u64,
    /// Label set of the series
    pub labels: Labels,
    /// Samples sorted by timestamp
    pub samples: Arc<[Sample]>,
}

/// Resolved set of series for one (range, step, matchers) key
#[async_trait]
pub trait SeriesSelector: Send + Sync {
    /// Resolve every matching series, querying storage at most once
    ///
    /// A failed resolution is remembered too: later callers get the same
    /// error without another storage query.
    async fn resolve(&self) -> Result<Arc<[ResolvedSeries]>, StorageError>;

    /// Storage matchers this selector was built from
    fn matchers(&self) -> &[LabelMatcher];

    /// Series belonging to `shard` out of `num_shards`
    async fn get_series(&self, shard: usize, num_shards: usize) -> QueryResult<Vec<SignedSeries>> {
        let all = self.resolve().await?;
        Ok(shard_series(&all, shard, num_shards))
    }

    /// Total number of series across all shards
    async fn series_count(&self) -> QueryResult<usize> {
        Ok(self.resolve().await?.len())
    }
}

/// Take the series of one shard, numbering them by position in the shard
pub fn shard_series(series: &[ResolvedSeries], shard: usize, num_shards: usize) -> Vec<SignedSeries> {
    if num_shards == 0 || shard >= num_shards {
        return Vec::new();
    }
    series
        .iter()
        .skip(shard)
        .step_by(num_shards)
        .enumerate()
        .map(|(position, s)| SignedSeries {
            signature: position as u64,
            labels: s.labels.clone(),
            samples: Arc::clone(&s.samples),
        })
        .collect()
}

/// Number of series shard `shard` receives out of `total`
#[inline]
pub fn shard_len(total: usize, shard: usize, num_shards: usize) -> usize {
    if num_shards == 0 || shard >= num_shards || shard >= total {
        return 0;
    }
    (total - shard).div_ceil(num_shards)
}
