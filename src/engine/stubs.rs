//! In-memory storage backend
//!
//! [`InMemoryStorage`] implements [`Queryable`] over series held in memory.
//! It is intended for:
//! - **Unit and integration testing** of the selector pipeline
//! - **Embedding** small, fully materialized datasets
//! - **Benchmarking** decode and merge without storage I/O
//!
//! Besides answering selects it counts them, can add an artificial delay to
//! every select, and can be told to fail, so caching, concurrency, and error
//! propagation can be observed from tests.
//!
//! # Example
//!
//! ```rust
//! use kuba_exec::engine::stubs::InMemoryStorage;
//! use kuba_exec::types::{Labels, Sample};
//!
//! let storage = InMemoryStorage::new();
//! storage
//!     .add_series(
//!         Labels::from_pairs(&[("__name__", "up"), ("job", "api")]),
//!         vec![Sample::new(0, 1.0), Sample::new(15_000, 1.0)],
//!     )
//!     .unwrap();
//! assert_eq!(storage.series_count(), 1);
//! ```

use crate::engine::traits::{Queryable, SelectHints, SeriesStream, StorageSeries};
use crate::error::StorageError;
use crate::query::ast::{matches_all, LabelMatcher};
use crate::types::{Labels, Sample, TimeRange};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Series store backed by a sorted map
///
/// Series are returned in label order, which keeps shard assignment
/// deterministic across runs.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    series: RwLock<BTreeMap<Labels, Vec<Sample>>>,
    selects: AtomicU64,
    latency: Option<Duration>,
    failure: RwLock<Option<StorageError>>,
}

impl InMemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every select by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Append samples to a series, creating it if needed
    ///
    /// Samples must be strictly increasing in time, also relative to what the
    /// series already holds.
    pub fn add_series(&self, labels: Labels, samples: Vec<Sample>) -> Result<(), StorageError> {
        let mut series = self.series.write();
        let existing = series.entry(labels.clone()).or_default();

        let mut last = existing.last().map(|s| s.timestamp);
        for sample in &samples {
            if last.is_some_and(|t| sample.timestamp <= t) {
                return Err(StorageError::OutOfOrder {
                    series: labels.to_string(),
                    timestamp: sample.timestamp,
                });
            }
            last = Some(sample.timestamp);
        }

        existing.extend(samples);
        Ok(())
    }

    /// Make every following select fail with `err`
    pub fn fail_selects_with(&self, err: StorageError) {
        *self.failure.write() = Some(err);
    }

    /// Stop injecting failures
    pub fn clear_failure(&self) {
        *self.failure.write() = None;
    }

    /// Number of select calls served so far (including failed ones)
    pub fn select_count(&self) -> u64 {
        self.selects.load(Ordering::Relaxed)
    }

    /// Number of stored series
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }
}

#[async_trait]
impl Queryable for InMemoryStorage {
    fn backend_id(&self) -> &str {
        "memory"
    }

    async fn select(
        &self,
        hints: &SelectHints,
        matchers: &[LabelMatcher],
    ) -> Result<SeriesStream, StorageError> {
        self.selects.fetch_add(1, Ordering::Relaxed);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self.failure.read().clone();
        if let Some(err) = failure {
            return Err(err);
        }

        let range = TimeRange::new(hints.start, hints.end)?;

        let selected: Vec<StorageSeries> = self
            .series
            .read()
            .iter()
            .filter(|(labels, _)| matches_all(matchers, labels))
            .filter_map(|(labels, samples)| {
                let from = samples.partition_point(|s| s.timestamp < range.start);
                let to = samples.partition_point(|s| s.timestamp <= range.end);
                (from < to).then(|| StorageSeries::new(labels.clone(), samples[from..to].to_vec()))
            })
            .collect();

        debug!(
            backend = self.backend_id(),
            start = hints.start,
            end = hints.end,
            series = selected.len(),
            "Served select"
        );

        Ok(Box::pin(futures::stream::iter(selected.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn storage() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        for (job, offset) in [("api", 0.0), ("db", 100.0)] {
            storage
                .add_series(
                    Labels::from_pairs(&[("__name__", "up"), ("job", job)]),
                    (0..10).map(|i| Sample::new(i * 1000, offset + i as f64)).collect(),
                )
                .unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn test_select_filters_by_matchers_and_range() {
        let storage = storage();
        let hints = SelectHints::new(2000, 4000);
        let stream = storage
            .select(&hints, &[LabelMatcher::equal("job", "db")])
            .await
            .unwrap();
        let series: Vec<StorageSeries> = stream.try_collect().await.unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels.get("job"), Some("db"));
        let ts: Vec<i64> = series[0].samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![2000, 3000, 4000]);
        assert_eq!(storage.select_count(), 1);
    }

    #[tokio::test]
    async fn test_series_without_samples_in_range_are_omitted() {
        let storage = storage();
        let stream = storage
            .select(&SelectHints::new(50_000, 60_000), &[])
            .await
            .unwrap();
        let series: Vec<StorageSeries> = stream.try_collect().await.unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let storage = storage();
        storage.fail_selects_with(StorageError::SelectFailed("injected".to_string()));
        let err = storage
            .select(&SelectHints::new(0, 1000), &[])
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("injected"));

        storage.clear_failure();
        assert!(storage.select(&SelectHints::new(0, 1000), &[]).await.is_ok());
        assert_eq!(storage.select_count(), 2);
    }

    #[test]
    fn test_add_series_rejects_out_of_order() {
        let storage = InMemoryStorage::new();
        let labels = Labels::from_pairs(&[("__name__", "up")]);
        storage
            .add_series(labels.clone(), vec![Sample::new(10, 1.0)])
            .unwrap();
        let err = storage
            .add_series(labels, vec![Sample::new(5, 1.0)])
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { timestamp: 5, .. }));
    }
}
