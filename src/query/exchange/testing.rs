//! Scripted operator for exchange tests

use crate::query::error::{QueryError, QueryResult};
use crate::query::executor::ExecutionContext;
use crate::query::operators::{StepBatch, VectorOperator, VectorPool};
use crate::types::Labels;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const STEP_MS: i64 = 10;

/// One scripted response to `next`
pub enum Step {
    /// `steps` consecutive step vectors starting at `start`, every series present
    Batch { start: i64, steps: usize },
    /// Fail with a storage error carrying this message
    Fail(&'static str),
    /// Panic with this message
    Panic(&'static str),
    /// End of stream
    End,
    /// Never resolve
    Hang,
}

impl Step {
    pub fn batch(start: i64, steps: usize) -> Self {
        Step::Batch { start, steps }
    }
}

/// Operator that replays a fixed script
pub struct ScriptedOperator {
    series: Arc<[Labels]>,
    script: VecDeque<Step>,
    pool: VectorPool,
    pulls: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
}

impl ScriptedOperator {
    pub fn new(num_series: usize, script: Vec<Step>) -> Self {
        Self {
            series: Self::make_series(None, num_series),
            script: script.into(),
            pool: VectorPool::new(),
            pulls: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tag every series with `input=<name>`
    pub fn named(mut self, name: &str) -> Self {
        self.series = Self::make_series(Some(name), self.series.len());
        self
    }

    /// Counter of `next` calls
    pub fn pulls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.pulls)
    }

    /// Flag set once the operator is dropped
    pub fn dropped(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dropped)
    }

    fn make_series(input: Option<&str>, n: usize) -> Arc<[Labels]> {
        (0..n)
            .map(|i| {
                let id = i.to_string();
                match input {
                    Some(name) => Labels::from_pairs(&[("input", name), ("series", id.as_str())]),
                    None => Labels::from_pairs(&[("series", id.as_str())]),
                }
            })
            .collect::<Vec<_>>()
            .into()
    }
}

#[async_trait]
impl VectorOperator for ScriptedOperator {
    async fn next(&mut self, _ctx: &ExecutionContext) -> QueryResult<Option<StepBatch>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front() {
            None | Some(Step::End) => Ok(None),
            Some(Step::Fail(msg)) => Err(QueryError::storage(msg)),
            Some(Step::Panic(msg)) => panic!("{}", msg),
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Batch { start, steps }) => {
                let mut batch = self.pool.get_vector_batch();
                for i in 0..steps {
                    let t = start + i as i64 * STEP_MS;
                    let mut vector = self.pool.get_step_vector(t);
                    for id in 0..self.series.len() {
                        vector.push(id as u64, t as f64);
                    }
                    batch.push(vector);
                }
                Ok(Some(batch))
            }
        }
    }

    async fn series(&mut self, _ctx: &ExecutionContext) -> QueryResult<Arc<[Labels]>> {
        Ok(Arc::clone(&self.series))
    }

    fn pool(&self) -> VectorPool {
        self.pool.clone()
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

impl Drop for ScriptedOperator {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}
