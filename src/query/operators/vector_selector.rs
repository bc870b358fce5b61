//! Vector Selector - instant selection over one shard of series
//!
//! For each step `t` the selector emits, per series, the most recent sample
//! at or before `t - offset` that is no older than the lookback delta.
//! Series whose latest sample is a staleness marker are absent.
//!
//! Steps are emitted `steps_batch` at a time. With a non-zero batch size the
//! same step window is emitted once per chunk of at most `batch_size`
//! series; every shard emits the same number of chunks per window (padding
//! with empty step vectors) so that downstream merges stay aligned.

use crate::metrics;
use crate::query::ast::VectorSelectorNode;
use crate::query::error::{QueryError, QueryResult};
use crate::query::executor::{ExecutionContext, QueryOptions};
use crate::query::operators::{StepBatch, VectorOperator, VectorPool};
use crate::query::selector::{SeriesSelector, SignedSeries};
use crate::types::{is_stale_nan, Labels, Sample};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Number of chunks each shard emits per step window
///
/// Derived from the largest shard so all shards agree on it.
pub(crate) fn chunks_per_window(total_series: usize, num_shards: usize, batch_size: usize) -> usize {
    if batch_size == 0 || num_shards == 0 {
        return 1;
    }
    total_series
        .div_ceil(num_shards)
        .div_ceil(batch_size)
        .max(1)
}

/// Series range `[from, to)` covered by `chunk`
pub(crate) fn chunk_bounds(chunk: usize, batch_size: usize, len: usize) -> (usize, usize) {
    if batch_size == 0 {
        return (0, len);
    }
    let from = (chunk * batch_size).min(len);
    let to = (from + batch_size).min(len);
    (from, to)
}

/// Wait for the shard's series, giving up when the context is cancelled
pub(crate) async fn load_shard(
    selector: &dyn SeriesSelector,
    ctx: &ExecutionContext,
    shard: usize,
    num_shards: usize,
) -> QueryResult<(Vec<SignedSeries>, usize)> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(QueryError::cancelled("cancelled while loading series")),
        loaded = async {
            let series = selector.get_series(shard, num_shards).await?;
            let total = selector.series_count().await?;
            Ok::<_, QueryError>((series, total))
        } => loaded,
    }
}

/// Instant selector over one shard
pub struct VectorSelector {
    pool: VectorPool,
    selector: Arc<dyn SeriesSelector>,
    shard: usize,
    num_shards: usize,

    mint: i64,
    maxt: i64,
    step: i64,
    lookback_delta: i64,
    offset: i64,
    steps_batch: usize,
    batch_size: usize,
    select_timestamp: bool,

    loaded: bool,
    series: Vec<SignedSeries>,
    labels: Arc<[Labels]>,
    cursors: Vec<usize>,
    chunks_per_window: usize,
    chunk: usize,
    current_step: i64,
}

impl VectorSelector {
    /// Create the operator for shard `shard` of `num_shards`
    pub fn new(
        pool: VectorPool,
        selector: Arc<dyn SeriesSelector>,
        opts: &QueryOptions,
        node: &VectorSelectorNode,
        shard: usize,
        num_shards: usize,
    ) -> Self {
        pool.set_step_size(opts.steps_batch);
        Self {
            pool,
            selector,
            shard,
            num_shards,
            mint: opts.start_ms,
            maxt: opts.end_ms,
            step: opts.effective_step_ms(),
            lookback_delta: opts.lookback_delta_ms,
            offset: node.offset_ms,
            steps_batch: opts.steps_batch.max(1),
            batch_size: node.batch_size,
            select_timestamp: node.select_timestamp,
            loaded: false,
            series: Vec::new(),
            labels: Arc::from(Vec::new()),
            cursors: Vec::new(),
            chunks_per_window: 1,
            chunk: 0,
            current_step: opts.start_ms,
        }
    }

    async fn load_series(&mut self, ctx: &ExecutionContext) -> QueryResult<()> {
        if self.loaded {
            return Ok(());
        }
        let (series, total) =
            load_shard(self.selector.as_ref(), ctx, self.shard, self.num_shards).await?;

        self.labels = series.iter().map(|s| s.labels.clone()).collect();
        self.cursors = vec![0; series.len()];
        self.chunks_per_window = chunks_per_window(total, self.num_shards, self.batch_size);
        self.series = series;
        self.loaded = true;

        debug!(
            shard = self.shard,
            shards = self.num_shards,
            series = self.series.len(),
            chunks_per_window = self.chunks_per_window,
            "Vector selector loaded shard"
        );
        Ok(())
    }

    fn fill(&mut self, batch: &mut StepBatch) {
        let (from, to) = chunk_bounds(self.chunk, self.batch_size, self.series.len());
        for i in from..to {
            let series = &self.series[i];
            let cursor = &mut self.cursors[i];
            for vector in batch.iter_mut() {
                let ts = vector.t - self.offset;
                if let Some(sample) = select_point(&series.samples, cursor, ts, self.lookback_delta) {
                    let value = if self.select_timestamp {
                        sample.timestamp as f64 / 1000.0
                    } else {
                        sample.value
                    };
                    vector.push(series.signature, value);
                }
            }
        }
    }
}

/// Most recent sample at or before `ts`, if within `lookback` and not stale
///
/// `cursor` counts the samples at or before the previous `ts` and only
/// moves forward.
fn select_point(samples: &[Sample], cursor: &mut usize, ts: i64, lookback: i64) -> Option<Sample> {
    while *cursor < samples.len() && samples[*cursor].timestamp <= ts {
        *cursor += 1;
    }
    let sample = samples.get(cursor.checked_sub(1)?)?;
    if ts - sample.timestamp > lookback || is_stale_nan(sample.value) {
        return None;
    }
    Some(*sample)
}

#[async_trait]
impl VectorOperator for VectorSelector {
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
        "vector_selector"
    }
}

// ============================================================================
// Tests
// ============================================================================
