//! Coalesce exchange - merges N step-aligned inputs into one stream
//!
//! All inputs are pulled concurrently for every batch. Their step vectors
//! are concatenated step by step, with each input's sample ids shifted by
//! the total series count of the inputs before it, so the merged ids index
//! straight into the concatenated series list.
//!
//! Inputs must stay in lockstep: the same number of steps with the same
//! timestamps in every batch, and the same end of stream. Anything else is
//! an internal error.

use crate::metrics;
use crate::query::error::{QueryError, QueryResult};
use crate::query::executor::ExecutionContext;
use crate::query::operators::{StepBatch, VectorOperator, VectorPool};
use crate::types::Labels;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// N-way step-aligned merge
pub struct Coalesce {
    pool: VectorPool,
    inputs: Vec<Box<dyn VectorOperator>>,
    input_pools: Vec<VectorPool>,
    offsets: Vec<u64>,
    series: Option<Arc<[Labels]>>,
    size_hint: usize,
    done: bool,
}

impl Coalesce {
    /// Merge `inputs`; `size_hint` is the expected series per step (0 if unknown)
    pub fn new(pool: VectorPool, size_hint: usize, inputs: Vec<Box<dyn VectorOperator>>) -> Self {
        let input_pools = inputs.iter().map(|op| op.pool()).collect();
        Self {
            pool,
            inputs,
            input_pools,
            offsets: Vec::new(),
            series: None,
            size_hint,
            done: false,
        }
    }

    /// Number of merged inputs still attached
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Drop every input, which stops their workers
    fn fail(&mut self, e: QueryError) -> QueryError {
        warn!(inputs = self.inputs.len(), error = %e, "Coalesce failed, dropping inputs");
        metrics::record_operator_error(self.name());
        self.inputs.clear();
        self.done = true;
        e
    }

    async fn load_series(&mut self, ctx: &ExecutionContext) -> QueryResult<Arc<[Labels]>> {
        if let Some(series) = &self.series {
            return Ok(Arc::clone(series));
        }

        let resolved = try_join_all(self.inputs.iter_mut().map(|op| op.series(ctx))).await;
        let per_input = match resolved {
            Ok(per_input) => per_input,
            Err(e) => return Err(self.fail(e)),
        };

        let mut offsets = Vec::with_capacity(per_input.len());
        let mut all = Vec::with_capacity(per_input.iter().map(|s| s.len()).sum());
        for series in &per_input {
            offsets.push(all.len() as u64);
            all.extend(series.iter().cloned());
        }

        debug!(inputs = per_input.len(), series = all.len(), "Coalesce resolved series");

        let series: Arc<[Labels]> = Arc::from(all);
        self.offsets = offsets;
        self.series = Some(Arc::clone(&series));
        Ok(series)
    }

    /// Hand pulled vectors back to the pool of the input they came from
    fn release(&self, pulled: impl IntoIterator<Item = Option<StepBatch>>) {
        for (batch, pool) in pulled.into_iter().zip(self.input_pools.iter()) {
            if let Some(batch) = batch {
                pool.put_vectors(batch);
            }
        }
    }

    fn check_alignment(batches: &[StepBatch]) -> QueryResult<()> {
        let Some(first) = batches.first() else {
            return Ok(());
        };
        for (input, batch) in batches.iter().enumerate().skip(1) {
            if batch.len() != first.len() {
                return Err(QueryError::internal(format!(
                    "input {} returned {} steps, input 0 returned {}",
                    input,
                    batch.len(),
                    first.len()
                )));
            }
            if let Some((a, b)) = first.iter().zip(batch.iter()).find(|(a, b)| a.t != b.t) {
                return Err(QueryError::internal(format!(
                    "input {} is at step {}, input 0 is at step {}",
                    input, b.t, a.t
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VectorOperator for Coalesce {
    async fn next(&mut self, ctx: &ExecutionContext) -> QueryResult<Option<StepBatch>> {
        if self.done {
            return Ok(None);
        }
        ctx.check_cancelled()?;
        self.load_series(ctx).await?;

        let pulled = try_join_all(self.inputs.iter_mut().map(|op| op.next(ctx))).await;
        let pulled = match pulled {
            Ok(pulled) => pulled,
            Err(e) => return Err(self.fail(e)),
        };

        let ended: Vec<usize> = pulled
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.is_none().then_some(i))
            .collect();
        if ended.len() == pulled.len() {
            self.done = true;
            return Ok(None);
        }

        if !ended.is_empty() {
            self.release(pulled);
            return Err(self.fail(QueryError::internal(format!(
                "inputs {:?} ended before the others",
                ended
            ))));
        }
        let batches: Vec<StepBatch> = pulled.into_iter().flatten().collect();
        if let Err(e) = Self::check_alignment(&batches) {
            self.release(batches.into_iter().map(Some));
            return Err(self.fail(e));
        }

        let steps = batches.first().map_or(0, |b| b.len());
        let mut out = self.pool.get_vector_batch();
        for step in 0..steps {
            let mut vector = self.pool.get_step_vector(batches[0][step].t);
            let width: usize = batches.iter().map(|b| b[step].len()).sum();
            vector.sample_ids.reserve(width.max(self.size_hint));
            vector.samples.reserve(width.max(self.size_hint));

            for (input, batch) in batches.iter().enumerate() {
                let offset = self.offsets[input];
                let src = &batch[step];
                vector
                    .sample_ids
                    .extend(src.sample_ids.iter().map(|id| id + offset));
                vector.samples.extend_from_slice(&src.samples);
            }
            out.push(vector);
        }
        self.release(batches.into_iter().map(Some));

        metrics::record_step_batch(self.name());
        Ok(Some(out))
    }

    async fn series(&mut self, ctx: &ExecutionContext) -> QueryResult<Arc<[Labels]>> {
        self.load_series(ctx).await
    }

    fn pool(&self) -> VectorPool {
        self.pool.clone()
    }

    fn name(&self) -> &'static str {
        "coalesce"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::exchange::testing::{ScriptedOperator, Step};
    use crate::query::exchange::Concurrent;
    use crate::query::QueryErrorKind;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn boxed(op: ScriptedOperator) -> Box<dyn VectorOperator> {
        Box::new(op)
    }

    #[tokio::test]
    async fn test_merges_with_shifted_ids() {
        let a = ScriptedOperator::new(2, vec![Step::batch(0, 2), Step::End]).named("a");
        let b = ScriptedOperator::new(3, vec![Step::batch(0, 2), Step::End]).named("b");
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, vec![boxed(a), boxed(b)]);
        let ctx = ExecutionContext::default();

        let series = coalesce.series(&ctx).await.unwrap();
        assert_eq!(series.len(), 5);
        assert_eq!(series[2].get("input"), Some("b"));

        let batch = coalesce.next(&ctx).await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].t, 0);
        assert_eq!(batch[1].t, 10);
        assert_eq!(batch[0].sample_ids, vec![0, 1, 2, 3, 4]);
        assert!(coalesce.next(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_releases_input_vectors() {
        let a = ScriptedOperator::new(1, vec![Step::batch(0, 3), Step::End]);
        let a_pool = a.pool();
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, vec![boxed(a)]);
        let ctx = ExecutionContext::default();

        coalesce.next(&ctx).await.unwrap().unwrap();
        assert_eq!(a_pool.pooled_vectors(), 3);
    }

    #[tokio::test]
    async fn test_early_end_is_internal_error() {
        let a = ScriptedOperator::new(1, vec![Step::batch(0, 1), Step::batch(10, 1), Step::End]);
        let b = ScriptedOperator::new(1, vec![Step::batch(0, 1), Step::End]);
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, vec![boxed(a), boxed(b)]);
        let ctx = ExecutionContext::default();

        assert!(coalesce.next(&ctx).await.unwrap().is_some());
        let err = coalesce.next(&ctx).await.unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Internal);
        assert!(err.message.contains("[1]"));
        assert_eq!(coalesce.num_inputs(), 0);
        assert!(coalesce.next(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_early_end_releases_to_owning_pool() {
        let a = ScriptedOperator::new(1, vec![Step::End]);
        let b = ScriptedOperator::new(1, vec![Step::batch(0, 3)]);
        let (a_pool, b_pool) = (a.pool(), b.pool());
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, vec![boxed(a), boxed(b)]);

        let err = coalesce.next(&ExecutionContext::default()).await.unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Internal);
        assert_eq!(a_pool.pooled_vectors(), 0);
        assert_eq!(b_pool.pooled_vectors(), 3);
    }

    #[tokio::test]
    async fn test_panicking_shards_are_not_end_of_stream() {
        let inputs: Vec<Box<dyn VectorOperator>> = (0..2)
            .map(|_| {
                let op = ScriptedOperator::new(1, vec![Step::Panic("decoder bug")]);
                Box::new(Concurrent::new(boxed(op), 2)) as Box<dyn VectorOperator>
            })
            .collect();
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, inputs);

        let err = coalesce.next(&ExecutionContext::default()).await.unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_misaligned_steps_are_internal_error() {
        let a = ScriptedOperator::new(1, vec![Step::batch(0, 2)]);
        let b = ScriptedOperator::new(1, vec![Step::batch(5, 2)]);
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, vec![boxed(a), boxed(b)]);

        let err = coalesce.next(&ExecutionContext::default()).await.unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_step_count_mismatch_is_internal_error() {
        let a = ScriptedOperator::new(1, vec![Step::batch(0, 2)]);
        let b = ScriptedOperator::new(1, vec![Step::batch(0, 3)]);
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, vec![boxed(a), boxed(b)]);

        let err = coalesce.next(&ExecutionContext::default()).await.unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_no_inputs_is_empty_stream() {
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, vec![]);
        let ctx = ExecutionContext::default();
        assert!(coalesce.series(&ctx).await.unwrap().is_empty());
        assert!(coalesce.next(&ctx).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_error_stops_siblings() {
        let failing = ScriptedOperator::new(1, vec![Step::Fail("shard exploded")]);
        let hanging = ScriptedOperator::new(1, vec![Step::Hang]);
        let hanging_dropped = hanging.dropped();

        let inputs: Vec<Box<dyn VectorOperator>> = vec![
            Box::new(Concurrent::new(boxed(failing), 2)),
            Box::new(Concurrent::new(boxed(hanging), 2)),
        ];
        let mut coalesce = Coalesce::new(VectorPool::new(), 0, inputs);
        let ctx = ExecutionContext::default();

        let result = tokio::time::timeout(Duration::from_secs(2), coalesce.next(&ctx)).await;
        let err = result.expect("merge stayed blocked").unwrap_err();
        assert!(err.message.contains("shard exploded"));

        for _ in 0..100 {
            if hanging_dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(hanging_dropped.load(Ordering::SeqCst));
    }
}
