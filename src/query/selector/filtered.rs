//! Selector that narrows a shared base selector with extra matchers

use crate::error::StorageError;
use crate::query::ast::{matches_all, LabelMatcher};
use crate::query::selector::{ResolvedSeries, SeriesSelector, SeriesSelectorImpl};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Applies post-select filters on top of a cached base selector
///
/// Sharding happens over the filtered list, so shards stay balanced even
/// when the filters drop most series.
#[derive(Debug)]
pub struct FilteredSelector {
    inner: Arc<SeriesSelectorImpl>,
    filters: Vec<LabelMatcher>,
    series: OnceCell<Result<Arc<[ResolvedSeries]>, StorageError>>,
}

impl FilteredSelector {
    /// Wrap `inner` with `filters`
    pub fn new(inner: Arc<SeriesSelectorImpl>, filters: Vec<LabelMatcher>) -> Self {
        Self {
            inner,
            filters,
            series: OnceCell::new(),
        }
    }

    /// The post-select filters
    pub fn filters(&self) -> &[LabelMatcher] {
        &self.filters
    }
}

#[async_trait]
impl SeriesSelector for FilteredSelector {
    async fn resolve(&self) -> Result<Arc<[ResolvedSeries]>, StorageError> {
        self.series
            .get_or_init(|| async {
                let all = self.inner.resolve().await?;
                let kept: Vec<ResolvedSeries> = all
                    .iter()
                    .filter(|s| matches_all(&self.filters, &s.labels))
                    .cloned()
                    .collect();
                Ok(Arc::from(kept))
            })
            .await
            .clone()
    }

    fn matchers(&self) -> &[LabelMatcher] {
        self.inner.matchers()
    }
}
