//! Core trait definitions for pluggable storage backends

use crate::error::StorageError;
use crate::query::ast::LabelMatcher;
use crate::types::{Labels, Sample};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

// =============================================================================
// Queryable Trait
// =============================================================================

/// Stream of series returned by a select call
pub type SeriesStream = Pin<Box<dyn Stream<Item = Result<StorageSeries, StorageError>> + Send>>;

/// A storage backend the selectors can read series from
///
/// `select` is called at most once per distinct selector per query, so
/// implementations do not need their own result caching.
#[async_trait]
pub trait Queryable: Send + Sync + 'static {
    /// Identifier for this backend, used in logs
    fn backend_id(&self) -> &str;

    /// Select every series matching all `matchers` within the hinted range
    ///
    /// Samples of each series must be sorted by timestamp. Series order is
    /// the order shards are assigned in, so it should be stable for a given
    /// request.
    async fn select(
        &self,
        hints: &SelectHints,
        matchers: &[LabelMatcher],
    ) -> Result<SeriesStream, StorageError>;
}

/// One series as returned by storage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageSeries {
    /// Label set of the series
    pub labels: Labels,
    /// Samples sorted by timestamp
    pub samples: Vec<Sample>,
}

impl StorageSeries {
    /// Create a series
    pub fn new(labels: Labels, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }
}

/// Hints passed to storage alongside the matchers
///
/// `start` and `end` already include lookback, range, and offset, so they
/// cover every sample any step may read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectHints {
    /// First timestamp any step may read (ms)
    pub start: i64,
    /// Last timestamp any step may read (ms)
    pub end: i64,
    /// Query step (ms)
    pub step: i64,
    /// Function wrapping the selector, if any
    pub func: Option<String>,
    /// Matrix window width (ms), 0 for instant selectors
    pub range: i64,
}

impl SelectHints {
    /// Create hints for a time range
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }
}
