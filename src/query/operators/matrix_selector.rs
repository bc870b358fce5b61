//! Matrix Selector - windowed function application over one shard
//!
//! For each step `t` every series of the shard is reduced over the samples
//! in `[t - offset - range, t - offset]` by a range function such as `rate`
//! or `quantile_over_time`. Windows slide incrementally: samples leave from
//! the front and enter from a per-series cursor, so no sample is read twice.

use crate::metrics;
use crate::query::ast::{FunctionCall, MatrixSelectorNode};
use crate::query::error::QueryResult;
use crate::query::executor::{ExecutionContext, QueryOptions};
use crate::query::operators::functions::{FunctionArg, RangeFunction};
use crate::query::operators::vector_selector::{chunk_bounds, chunks_per_window, load_shard};
use crate::query::operators::window::SampleWindow;
use crate::query::operators::{StepBatch, VectorOperator, VectorPool};
use crate::query::selector::{SeriesSelector, SignedSeries};
use crate::types::Labels;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Range-function selector over one shard
pub struct MatrixSelector {
    pool: VectorPool,
    selector: Arc<dyn SeriesSelector>,
    shard: usize,
    num_shards: usize,

    function: RangeFunction,
    scalar: f64,
    mint: i64,
    maxt: i64,
    step: i64,
    range: i64,
    offset: i64,
    steps_batch: usize,
    batch_size: usize,

    loaded: bool,
    series: Vec<SignedSeries>,
    labels: Arc<[Labels]>,
    windows: Vec<SampleWindow>,
    chunks_per_window: usize,
    chunk: usize,
    current_step: i64,
}

impl MatrixSelector {
    /// Create the operator for shard `shard` of `num_shards`
    ///
    /// Fails with `NotSupported` for unknown functions and for scalar
    /// arguments that are not literals.
    pub fn new(
        pool: VectorPool,
        selector: Arc<dyn SeriesSelector>,
        opts: &QueryOptions,
        node: &MatrixSelectorNode,
        call: &FunctionCall,
        shard: usize,
        num_shards: usize,
    ) -> QueryResult<Self> {
        let (function, scalar) = RangeFunction::from_call(call)?;
        pool.set_step_size(opts.steps_batch);

        Ok(Self {
            pool,
            selector,
            shard,
            num_shards,
            function,
            scalar,
            mint: opts.start_ms,
            maxt: opts.end_ms,
            step: opts.effective_step_ms(),
            range: node.range_ms,
            offset: node.vector_selector.offset_ms,
            steps_batch: opts.steps_batch.max(1),
            batch_size: node.vector_selector.batch_size,
            loaded: false,
            series: Vec::new(),
            labels: Arc::from(Vec::new()),
            windows: Vec::new(),
            chunks_per_window: 1,
            chunk: 0,
            current_step: opts.start_ms,
        })
    }

    /// The function applied to each window
    pub fn function(&self) -> RangeFunction {
        self.function
    }

    async fn load_series(&mut self, ctx: &ExecutionContext) -> QueryResult<()> {
        if self.loaded {
            return Ok(());
        }
        let (series, total) =
            load_shard(self.selector.as_ref(), ctx, self.shard, self.num_shards).await?;

        let keep_name = self.function.keeps_metric_name();
        self.labels = series
            .iter()
            .map(|s| {
                if keep_name {
                    s.labels.clone()
                } else {
                    s.labels.without_metric_name()
                }
            })
            .collect();
        self.windows = vec![SampleWindow::new(); series.len()];
        self.chunks_per_window = chunks_per_window(total, self.num_shards, self.batch_size);
        self.series = series;
        self.loaded = true;

        debug!(
            shard = self.shard,
            shards = self.num_shards,
            function = %self.function,
            series = self.series.len(),
            "Matrix selector loaded shard"
        );
        Ok(())
    }

    fn fill(&mut self, batch: &mut StepBatch) {
        let (from, to) = chunk_bounds(self.chunk, self.batch_size, self.series.len());
        for i in from..to {
            let series = &self.series[i];
            let window = &mut self.windows[i];
            for vector in batch.iter_mut() {
                let arg = FunctionArg {
                    step_time: vector.t,
                    range_ms: self.range,
                    offset_ms: self.offset,
                    scalar: self.scalar,
                };
                window.advance(&series.samples, arg.range_start(), arg.range_end());
                if let Some(value) = self.function.eval(window.samples(), &arg) {
                    vector.push(series.signature, value);
                }
            }
        }
    }
}

#[async_trait]
impl VectorOperator for MatrixSelector {
    async fn next(&mut self, ctx: &ExecutionContext) -> QueryResult<Option<StepBatch>> {
        ctx.check_cancelled()?;
        if let Err(e) = self.load_series(ctx).await {
            metrics::record_operator_error(self.name());
            return Err(e);
        }
        if self.current_step > self.maxt {
            return Ok(None);
        }

        let mut batch = self.pool.get_vector_batch();
        let mut t = self.current_step;
        for _ in 0..self.steps_batch {
            if t > self.maxt {
                break;
            }
            batch.push(self.pool.get_step_vector(t));
            t += self.step;
        }

        self.fill(&mut batch);

        self.chunk += 1;
        if self.chunk >= self.chunks_per_window {
            self.chunk = 0;
            self.current_step = t;
        }

        metrics::record_step_batch(self.name());
        Ok(Some(batch))
    }

    async fn series(&mut self, ctx: &ExecutionContext) -> QueryResult<Arc<[Labels]>> {
        self.load_series(ctx).await?;
        Ok(Arc::clone(&self.labels))
    }

    fn pool(&self) -> VectorPool {
        self.pool.clone()
    }

    fn name(&self) -> &'static str {
        "matrix_selector"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stubs::InMemoryStorage;
    use crate::engine::traits::SelectHints;
    use crate::query::ast::{Expr, LabelMatcher, VectorSelectorNode};
    use crate::query::operators::StepVector;
    use crate::query::selector::SelectorPool;
    use crate::query::QueryErrorKind;
    use crate::types::Sample;

    fn selector_over(points: &[(i64, f64)]) -> (Arc<InMemoryStorage>, Arc<dyn SeriesSelector>) {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .add_series(
                Labels::from_pairs(&[("__name__", "requests_total"), ("job", "api")]),
                points.iter().map(|&(t, v)| Sample::new(t, v)).collect(),
            )
            .unwrap();
        let pool = SelectorPool::new(storage.clone());
        let selector = pool.get_filtered_selector(
            i64::MIN / 2,
            i64::MAX / 2,
            0,
            &[LabelMatcher::equal("__name__", "requests_total")],
            &[],
            &SelectHints::default(),
        );
        (storage, selector)
    }

    fn node(range_ms: i64) -> MatrixSelectorNode {
        MatrixSelectorNode::new(VectorSelectorNode::new(vec![]), range_ms)
    }

    async fn drain(op: &mut MatrixSelector) -> Vec<StepVector> {
        let ctx = ExecutionContext::default();
        let mut out = Vec::new();
        while let Some(batch) = op.next(&ctx).await.unwrap() {
            out.extend(batch);
        }
        out
    }

    #[tokio::test]
    async fn test_window_is_closed_on_both_ends() {
        let (_, selector) = selector_over(&[(0, 1.0), (10, 1.0), (20, 1.0), (30, 1.0)]);
        let opts = QueryOptions::range(20, 30, 10);
        let call = FunctionCall::new("count_over_time", vec![]);
        let mut op =
            MatrixSelector::new(VectorPool::new(), selector, &opts, &node(10), &call, 0, 1)
                .unwrap();

        let out = drain(&mut op).await;
        // [10, 20] and [20, 30] each hold two samples
        assert_eq!(out[0].samples, vec![2.0]);
        assert_eq!(out[1].samples, vec![2.0]);
    }

    #[tokio::test]
    async fn test_offset_moves_window() {
        let (_, selector) = selector_over(&[(0, 5.0), (100, 9.0)]);
        let opts = QueryOptions::instant(100);
        let matrix = MatrixSelectorNode::new(VectorSelectorNode::new(vec![]).with_offset_ms(100), 50);
        let call = FunctionCall::new("max_over_time", vec![]);
        let mut op =
            MatrixSelector::new(VectorPool::new(), selector, &opts, &matrix, &call, 0, 1).unwrap();

        let out = drain(&mut op).await;
        assert_eq!(out[0].samples, vec![5.0]);
    }

    #[tokio::test]
    async fn test_rate_over_steps() {
        let points: Vec<(i64, f64)> = (0..=12).map(|i| (i * 10_000, i as f64 * 10.0)).collect();
        let (_, selector) = selector_over(&points);
        let opts = QueryOptions::range(60_000, 120_000, 30_000);
        let call = FunctionCall::new("rate", vec![]);
        let mut op =
            MatrixSelector::new(VectorPool::new(), selector, &opts, &node(60_000), &call, 0, 1)
                .unwrap();

        let out = drain(&mut op).await;
        assert_eq!(out.len(), 3);
        for v in &out {
            assert!((v.samples[0] - 1.0).abs() < 1e-9, "rate at {} was {}", v.t, v.samples[0]);
        }
    }

    #[tokio::test]
    async fn test_metric_name_dropped_except_last_over_time() {
        let ctx = ExecutionContext::default();
        let opts = QueryOptions::instant(0);

        let (_, selector) = selector_over(&[(0, 1.0)]);
        let call = FunctionCall::new("sum_over_time", vec![]);
        let mut op =
            MatrixSelector::new(VectorPool::new(), selector, &opts, &node(10), &call, 0, 1)
                .unwrap();
        let labels = op.series(&ctx).await.unwrap();
        assert_eq!(labels[0].metric_name(), None);
        assert_eq!(labels[0].get("job"), Some("api"));

        let (_, selector) = selector_over(&[(0, 1.0)]);
        let call = FunctionCall::new("last_over_time", vec![]);
        let mut op =
            MatrixSelector::new(VectorPool::new(), selector, &opts, &node(10), &call, 0, 1)
                .unwrap();
        let labels = op.series(&ctx).await.unwrap();
        assert_eq!(labels[0].metric_name(), Some("requests_total"));
    }

    #[tokio::test]
    async fn test_quantile_uses_literal_arg() {
        let (_, selector) = selector_over(&[(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0), (4, 5.0)]);
        let opts = QueryOptions::instant(4);
        let call = FunctionCall::new(
            "quantile_over_time",
            vec![Expr::NumberLiteral(0.5), Expr::MatrixSelector(node(10))],
        );
        let mut op =
            MatrixSelector::new(VectorPool::new(), selector, &opts, &node(10), &call, 0, 1)
                .unwrap();

        let out = drain(&mut op).await;
        assert_eq!(out[0].samples, vec![3.0]);
    }

    #[tokio::test]
    async fn test_non_literal_arg_fails_before_reading() {
        let (storage, selector) = selector_over(&[(0, 1.0)]);
        let call = FunctionCall::new(
            "quantile_over_time",
            vec![
                Expr::VectorSelector(VectorSelectorNode::new(vec![])),
                Expr::MatrixSelector(node(10)),
            ],
        );
        let err = MatrixSelector::new(
            VectorPool::new(),
            selector,
            &QueryOptions::instant(0),
            &node(10),
            &call,
            0,
            1,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind, QueryErrorKind::NotSupported);
        assert_eq!(storage.select_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_function_not_supported() {
        let (_, selector) = selector_over(&[(0, 1.0)]);
        let call = FunctionCall::new("absent_over_time_2", vec![]);
        let err = MatrixSelector::new(
            VectorPool::new(),
            selector,
            &QueryOptions::instant(0),
            &node(10),
            &call,
            0,
            1,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind, QueryErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn test_empty_window_is_absent() {
        let (_, selector) = selector_over(&[(0, 1.0), (1_000, 2.0)]);
        let opts = QueryOptions::range(0, 1_000, 500);
        let call = FunctionCall::new("count_over_time", vec![]);
        let mut op =
            MatrixSelector::new(VectorPool::new(), selector, &opts, &node(100), &call, 0, 1)
                .unwrap();

        let out = drain(&mut op).await;
        assert_eq!(out[0].samples, vec![1.0]);
        assert!(out[1].is_empty());
        assert_eq!(out[2].samples, vec![1.0]);
    }
}
