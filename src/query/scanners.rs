//! Scanners - builds sharded selector pipelines
//!
//! For every selector node the factory resolves one shared selector through
//! the query's [`SelectorPool`], builds `decoding_concurrency` shard
//! operators over it, puts each behind a [`Concurrent`] exchange and merges
//! them with a single [`Coalesce`]:
//!
//! ```text
//!                      ┌──────────┐
//!                      │ Coalesce │
//!                      └────┬─────┘
//!            ┌──────────────┼──────────────┐
//!      ┌─────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐
//!      │ Concurrent │ │ Concurrent │ │ Concurrent │
//!      └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!      ┌─────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐
//!      │  shard 0   │ │  shard 1   │ │  shard 2   │
//!      └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!            └──────────────┼──────────────┘
//!                    ┌──────▼───────┐
//!                    │   selector   │  (one storage select)
//!                    └──────────────┘
//! ```
//!
//! A `Scanners` instance lives for one query; dropping it drops the cache.

use crate::engine::traits::{Queryable, SelectHints};
use crate::query::ast::{FunctionCall, MatrixSelectorNode, VectorSelectorNode};
use crate::query::error::QueryResult;
use crate::query::exchange::{Coalesce, Concurrent};
use crate::query::executor::QueryOptions;
use crate::query::operators::{
    MatrixSelector, RangeFunction, VectorOperator, VectorPool, VectorSelector,
};
use crate::query::selector::SelectorPool;
use std::sync::Arc;
use tracing::debug;

/// Read-ahead of each shard's worker, in batches
pub const SHARD_BUFFER_SIZE: usize = 2;

/// Storage hints for an instant selector
///
/// The range starts one lookback delta before the first step so the first
/// step can see its most recent sample.
pub fn vector_selector_hints(opts: &QueryOptions, node: &VectorSelectorNode) -> SelectHints {
    SelectHints {
        start: opts.start_ms - opts.lookback_delta_ms - node.offset_ms,
        end: opts.end_ms - node.offset_ms,
        step: opts.step_ms,
        func: None,
        range: 0,
    }
}

/// Storage hints for a range selector wrapped in `call`
pub fn matrix_selector_hints(
    opts: &QueryOptions,
    node: &MatrixSelectorNode,
    call: &FunctionCall,
) -> SelectHints {
    let offset = node.vector_selector.offset_ms;
    SelectHints {
        start: opts.start_ms - node.range_ms - offset,
        end: opts.end_ms - offset,
        step: opts.step_ms,
        func: Some(call.name.clone()),
        range: node.range_ms,
    }
}

/// Factory for sharded vector and matrix selector pipelines
pub struct Scanners {
    selectors: SelectorPool,
}

impl Scanners {
    /// Create a factory with an empty selector cache over `storage`
    pub fn new(storage: Arc<dyn Queryable>) -> Self {
        Self {
            selectors: SelectorPool::new(storage),
        }
    }

    /// The per-query selector cache
    pub fn selector_pool(&self) -> &SelectorPool {
        &self.selectors
    }

    /// Build the sharded pipeline for an instant selector
    pub fn new_vector_selector(
        &self,
        opts: &QueryOptions,
        hints: &SelectHints,
        node: &VectorSelectorNode,
    ) -> QueryResult<Box<dyn VectorOperator>> {
        opts.validate()?;

        let selector = self.selectors.get_filtered_selector(
            hints.start,
            hints.end,
            opts.step_ms,
            &node.matchers,
            &node.filters,
            hints,
        );

        let shards = opts.decoding_concurrency;
        let operators: Vec<Box<dyn VectorOperator>> = (0..shards)
            .map(|shard| {
                let op = VectorSelector::new(
                    VectorPool::new(),
                    Arc::clone(&selector),
                    opts,
                    node,
                    shard,
                    shards,
                );
                Box::new(Concurrent::new(Box::new(op), SHARD_BUFFER_SIZE)) as Box<dyn VectorOperator>
            })
            .collect();

        debug!(selector = %node, shards, "Built vector selector pipeline");

        Ok(Box::new(Coalesce::new(
            VectorPool::new(),
            node.batch_size * shards,
            operators,
        )))
    }

    /// Build the sharded pipeline for `call` over a range selector
    ///
    /// Fails with `NotSupported` before touching the selector cache when the
    /// function is unknown or a required scalar argument is not a literal.
    pub fn new_matrix_selector(
        &self,
        opts: &QueryOptions,
        hints: &SelectHints,
        node: &MatrixSelectorNode,
        call: &FunctionCall,
    ) -> QueryResult<Box<dyn VectorOperator>> {
        opts.validate()?;
        let (function, _) = RangeFunction::from_call(call)?;

        let vs = &node.vector_selector;
        let selector = self.selectors.get_filtered_selector(
            hints.start,
            hints.end,
            opts.step_ms,
            &vs.matchers,
            &vs.filters,
            hints,
        );

        let shards = opts.decoding_concurrency;
        let mut operators: Vec<Box<dyn VectorOperator>> = Vec::with_capacity(shards);
        for shard in 0..shards {
            let op = MatrixSelector::new(
                VectorPool::new(),
                Arc::clone(&selector),
                opts,
                node,
                call,
                shard,
                shards,
            )?;
            operators.push(Box::new(Concurrent::new(Box::new(op), SHARD_BUFFER_SIZE)));
        }

        debug!(
            selector = %node,
            function = function.name(),
            shards,
            "Built matrix selector pipeline"
        );

        Ok(Box::new(Coalesce::new(
            VectorPool::new(),
            vs.batch_size * shards,
            operators,
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stubs::InMemoryStorage;
    use crate::query::ast::{Expr, LabelMatcher};
    use crate::query::executor::{ExecutionContext, QueryExecutor};
    use crate::query::QueryErrorKind;
    use crate::types::{Labels, Sample};

    fn storage_with(n: usize) -> Arc<InMemoryStorage> {
        let storage = Arc::new(InMemoryStorage::new());
        for i in 0..n {
            let id = i.to_string();
            let labels = Labels::from_pairs(&[("__name__", "up"), ("instance", id.as_str())]);
            let samples = (0..10).map(|k| Sample::new(k * 10_000, (i * 100) as f64 + k as f64)).collect();
            storage.add_series(labels, samples).unwrap();
        }
        storage
    }

    fn up() -> VectorSelectorNode {
        VectorSelectorNode::new(vec![LabelMatcher::equal("__name__", "up")])
    }

    #[test]
    fn test_vector_hints_cover_lookback_and_offset() {
        let opts = QueryOptions::range(100_000, 200_000, 10_000).with_lookback_delta_ms(30_000);
        let node = up().with_offset_ms(5_000);
        let hints = vector_selector_hints(&opts, &node);
        assert_eq!(hints.start, 65_000);
        assert_eq!(hints.end, 195_000);
        assert_eq!(hints.step, 10_000);
        assert_eq!(hints.range, 0);
        assert!(hints.func.is_none());
    }

    #[test]
    fn test_matrix_hints_cover_range_and_offset() {
        let opts = QueryOptions::range(100_000, 200_000, 10_000);
        let node = MatrixSelectorNode::new(up().with_offset_ms(5_000), 60_000);
        let call = FunctionCall::new("rate", vec![Expr::MatrixSelector(node.clone())]);
        let hints = matrix_selector_hints(&opts, &node, &call);
        assert_eq!(hints.start, 35_000);
        assert_eq!(hints.end, 195_000);
        assert_eq!(hints.range, 60_000);
        assert_eq!(hints.func.as_deref(), Some("rate"));
    }

    #[tokio::test]
    async fn test_vector_pipeline_returns_every_series() {
        let storage = storage_with(5);
        let scanners = Scanners::new(storage.clone());
        let opts = QueryOptions::range(0, 90_000, 10_000).with_decoding_concurrency(3);
        let node = up();
        let hints = vector_selector_hints(&opts, &node);

        let op = scanners.new_vector_selector(&opts, &hints, &node).unwrap();
        assert_eq!(op.name(), "coalesce");

        let mut executor = QueryExecutor::new();
        let result = executor
            .execute_operator(op, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(result.len(), 5);
        for series in &result.series {
            assert_eq!(series.points.len(), 10);
        }
        assert_eq!(storage.select_count(), 1);
    }

    #[tokio::test]
    async fn test_identical_selectors_share_one_select() {
        let storage = storage_with(2);
        let scanners = Scanners::new(storage.clone());
        let opts = QueryOptions::range(0, 50_000, 10_000).with_decoding_concurrency(2);
        let node = up();
        let hints = vector_selector_hints(&opts, &node);

        let a = scanners.new_vector_selector(&opts, &hints, &node).unwrap();
        let b = scanners.new_vector_selector(&opts, &hints, &node).unwrap();

        let mut executor = QueryExecutor::new();
        let ctx = ExecutionContext::default();
        let ra = executor.execute_operator(a, &ctx).await.unwrap();
        let rb = executor.execute_operator(b, &ctx).await.unwrap();

        assert_eq!(ra, rb);
        assert_eq!(storage.select_count(), 1);
        assert_eq!(scanners.selector_pool().len(), 1);
    }

    #[tokio::test]
    async fn test_matrix_pipeline_applies_function() {
        let storage = storage_with(3);
        let scanners = Scanners::new(storage.clone());
        let opts = QueryOptions::instant(90_000).with_decoding_concurrency(2);
        let node = MatrixSelectorNode::new(up(), 90_000);
        let call = FunctionCall::new("count_over_time", vec![Expr::MatrixSelector(node.clone())]);
        let hints = matrix_selector_hints(&opts, &node, &call);

        let op = scanners
            .new_matrix_selector(&opts, &hints, &node, &call)
            .unwrap();
        let mut executor = QueryExecutor::new();
        let result = executor
            .execute_operator(op, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        for series in &result.series {
            assert!(series.labels.metric_name().is_none());
            assert_eq!(series.points, vec![(90_000, 10.0)]);
        }
    }

    #[tokio::test]
    async fn test_non_literal_quantile_fails_before_select() {
        let storage = storage_with(1);
        let scanners = Scanners::new(storage.clone());
        let opts = QueryOptions::instant(90_000);
        let node = MatrixSelectorNode::new(up(), 60_000);
        let call = FunctionCall::new(
            "quantile_over_time",
            vec![
                Expr::VectorSelector(up()),
                Expr::MatrixSelector(node.clone()),
            ],
        );
        let hints = matrix_selector_hints(&opts, &node, &call);

        let err = scanners
            .new_matrix_selector(&opts, &hints, &node, &call)
            .err()
            .unwrap();
        assert_eq!(err.kind, QueryErrorKind::NotSupported);
        assert!(scanners.selector_pool().is_empty());
        assert_eq!(storage.select_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let scanners = Scanners::new(storage_with(1));
        let opts = QueryOptions::range(100, 0, 10);
        let node = up();
        let hints = vector_selector_hints(&opts, &node);

        let err = scanners
            .new_vector_selector(&opts, &hints, &node)
            .err()
            .unwrap();
        assert_eq!(err.kind, QueryErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_storage_failure_reaches_caller() {
        let storage = storage_with(4);
        storage.fail_selects_with(crate::error::StorageError::SelectFailed(
            "disk on fire".to_string(),
        ));
        let scanners = Scanners::new(storage.clone());
        let opts = QueryOptions::range(0, 50_000, 10_000).with_decoding_concurrency(4);
        let node = up();
        let hints = vector_selector_hints(&opts, &node);

        let op = scanners.new_vector_selector(&opts, &hints, &node).unwrap();
        let mut executor = QueryExecutor::new();
        let err = executor
            .execute_operator(op, &ExecutionContext::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind, QueryErrorKind::Storage);
        assert!(err.to_string().contains("disk on fire"));
        assert_eq!(storage.select_count(), 1);
    }
}
