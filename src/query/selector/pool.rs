//! Selector Pool - per-query cache of resolved selectors
//!
//! Identical selector requests within a query share one selector, so the
//! storage backend sees a single select per distinct
//! `(start, end, step, matchers)` key no matter how many operators or shards
//! ask for it.
//!
//! The map is only locked to find or insert the handle; resolution itself
//! runs through a `tokio::sync::OnceCell` inside the selector, so concurrent
//! first users wait for one in-flight storage query instead of issuing their
//! own.

use crate::engine::traits::{Queryable, SelectHints};
use crate::error::StorageError;
use crate::metrics;
use crate::query::ast::LabelMatcher;
use crate::query::selector::{FilteredSelector, ResolvedSeries, SeriesSelector};
use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

// ============================================================================
// Base Selector
// ============================================================================

/// Selector that queries storage on first use
pub struct SeriesSelectorImpl {
    storage: Arc<dyn Queryable>,
    hints: SelectHints,
    matchers: Vec<LabelMatcher>,
    series: OnceCell<Result<Arc<[ResolvedSeries]>, StorageError>>,
}

impl SeriesSelectorImpl {
    /// Create an unresolved selector
    pub fn new(storage: Arc<dyn Queryable>, hints: SelectHints, matchers: Vec<LabelMatcher>) -> Self {
        Self {
            storage,
            hints,
            matchers,
            series: OnceCell::new(),
        }
    }

    /// Hints the storage query is issued with
    pub fn hints(&self) -> &SelectHints {
        &self.hints
    }

    /// Whether resolution has completed (successfully or not)
    pub fn is_resolved(&self) -> bool {
        self.series.initialized()
    }

    async fn load(&self) -> Result<Arc<[ResolvedSeries]>, StorageError> {
        let started = Instant::now();
        let result = self.select_all().await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(series) => {
                metrics::record_storage_select(elapsed, series.len(), true);
                debug!(
                    backend = self.storage.backend_id(),
                    start = self.hints.start,
                    end = self.hints.end,
                    matchers = self.matchers.len(),
                    series = series.len(),
                    "Resolved selector"
                );
            }
            Err(e) => {
                metrics::record_storage_select(elapsed, 0, false);
                warn!(
                    backend = self.storage.backend_id(),
                    error = %e,
                    "Selector resolution failed"
                );
            }
        }
        result
    }

    async fn select_all(&self) -> Result<Arc<[ResolvedSeries]>, StorageError> {
        let mut stream = self.storage.select(&self.hints, &self.matchers).await?;
        let mut series = Vec::new();

        while let Some(s) = stream.try_next().await? {
            if let Some(w) = s.samples.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
                return Err(StorageError::OutOfOrder {
                    series: s.labels.to_string(),
                    timestamp: w[1].timestamp,
                });
            }
            series.push(ResolvedSeries {
                labels: s.labels,
                samples: Arc::from(s.samples),
            });
        }

        Ok(Arc::from(series))
    }
}

#[async_trait]
impl SeriesSelector for SeriesSelectorImpl {
    async fn resolve(&self) -> Result<Arc<[ResolvedSeries]>, StorageError> {
        self.series.get_or_init(|| self.load()).await.clone()
    }

    fn matchers(&self) -> &[LabelMatcher] {
        &self.matchers
    }
}

impl std::fmt::Debug for SeriesSelectorImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesSelectorImpl")
            .field("backend", &self.storage.backend_id())
            .field("hints", &self.hints)
            .field("matchers", &self.matchers)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

// ============================================================================
// Selector Pool
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SelectorKey {
    start: i64,
    end: i64,
    step: i64,
    matchers: Vec<LabelMatcher>,
}

/// Lookup statistics
#[derive(Debug, Default)]
pub struct SelectorPoolStats {
    /// Lookups answered by an existing selector
    pub hits: AtomicU64,

    /// Lookups that created a selector
    pub misses: AtomicU64,
}

/// Per-query cache of selectors keyed by range, step and matcher content
pub struct SelectorPool {
    storage: Arc<dyn Queryable>,
    selectors: Mutex<HashMap<SelectorKey, Arc<SeriesSelectorImpl>>>,
    stats: SelectorPoolStats,
}

impl SelectorPool {
    /// Create an empty pool over a storage backend
    pub fn new(storage: Arc<dyn Queryable>) -> Self {
        Self {
            storage,
            selectors: Mutex::new(HashMap::new()),
            stats: SelectorPoolStats::default(),
        }
    }

    /// Get or create the selector for `(start, end, step, matchers)`
    ///
    /// `hints` is only used when the selector is created; its range and step
    /// are replaced by the key's.
    pub fn get_selector(
        &self,
        start: i64,
        end: i64,
        step: i64,
        matchers: &[LabelMatcher],
        hints: &SelectHints,
    ) -> Arc<SeriesSelectorImpl> {
        let key = SelectorKey {
            start,
            end,
            step,
            matchers: matchers.to_vec(),
        };

        let mut selectors = self.selectors.lock();
        if let Some(existing) = selectors.get(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_selector_lookup(true);
            return Arc::clone(existing);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_selector_lookup(false);

        let hints = SelectHints {
            start,
            end,
            step,
            ..hints.clone()
        };
        let selector = Arc::new(SeriesSelectorImpl::new(
            Arc::clone(&self.storage),
            hints,
            key.matchers.clone(),
        ));
        selectors.insert(key, Arc::clone(&selector));
        selector
    }

    /// Get a selector whose series are additionally filtered by `filters`
    ///
    /// The base selector is shared with plain lookups of the same key, so
    /// filters never cause an extra storage query.
    pub fn get_filtered_selector(
        &self,
        start: i64,
        end: i64,
        step: i64,
        matchers: &[LabelMatcher],
        filters: &[LabelMatcher],
        hints: &SelectHints,
    ) -> Arc<dyn SeriesSelector> {
        let base = self.get_selector(start, end, step, matchers, hints);
        if filters.is_empty() {
            return base;
        }
        Arc::new(FilteredSelector::new(base, filters.to_vec()))
    }

    /// Number of distinct selectors created
    pub fn len(&self) -> usize {
        self.selectors.lock().len()
    }

    /// Whether no selector was created yet
    pub fn is_empty(&self) -> bool {
        self.selectors.lock().is_empty()
    }

    /// Get lookup statistics
    pub fn stats(&self) -> &SelectorPoolStats {
        &self.stats
    }

    /// Get hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
