//! Concurrent exchange - runs an operator on its own task
//!
//! The wrapped operator is moved onto a tokio task on the first pull. The
//! task pulls it in a loop and pushes results into a bounded channel, so the
//! operator can decode ahead of its consumer by up to `buffer_size` batches.
//!
//! ```text
//!   consumer ──recv──▶ [ mpsc, buffer_size ] ◀──send── worker task ──next──▶ operator
//! ```
//!
//! The worker stops at end of stream, after forwarding the first error, when
//! the context is cancelled, or when the consumer goes away. Dropping the
//! exchange aborts the task. A closed channel is only end of stream once the
//! task has joined cleanly; a panicked worker surfaces as an internal error.

use crate::metrics;
use crate::query::error::{QueryError, QueryResult};
use crate::query::executor::ExecutionContext;
use crate::query::operators::{StepBatch, VectorOperator, VectorPool};
use crate::types::Labels;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum State {
    /// Not started; the operator is still owned here
    Idle(Box<dyn VectorOperator>),
    /// Worker task owns the operator
    Running {
        rx: mpsc::Receiver<QueryResult<StepBatch>>,
        handle: JoinHandle<()>,
    },
    /// Stream ended, failed, or was cancelled
    Done,
}

/// Decouples an operator from its consumer through a worker task
pub struct Concurrent {
    state: State,
    buffer_size: usize,
    pool: VectorPool,
    inner_name: &'static str,
    series: Option<Arc<[Labels]>>,
}

impl Concurrent {
    /// Wrap `next`, buffering up to `buffer_size` batches
    pub fn new(next: Box<dyn VectorOperator>, buffer_size: usize) -> Self {
        Self {
            pool: next.pool(),
            inner_name: next.name(),
            state: State::Idle(next),
            buffer_size: buffer_size.max(1),
            series: None,
        }
    }

    /// Whether the worker task has been started and not yet finished
    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    async fn start(&mut self, ctx: &ExecutionContext) -> QueryResult<()> {
        let State::Idle(mut op) = std::mem::replace(&mut self.state, State::Done) else {
            return Ok(());
        };

        if self.series.is_none() {
            self.series = Some(op.series(ctx).await?);
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let worker_ctx = ctx.clone();
        let name = self.inner_name;

        let handle = tokio::spawn(async move {
            let mut batches = 0u64;
            loop {
                let result = tokio::select! {
                    biased;
                    _ = worker_ctx.cancelled() => break,
                    result = op.next(&worker_ctx) => result,
                };

                match result {
                    Ok(Some(batch)) => {
                        batches += 1;
                        let sent = tokio::select! {
                            biased;
                            _ = worker_ctx.cancelled() => false,
                            sent = tx.send(Ok(batch)) => sent.is_ok(),
                        };
                        if !sent {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(operator = name, error = %e, "Worker failed");
                        tokio::select! {
                            biased;
                            _ = worker_ctx.cancelled() => {}
                            _ = tx.send(Err(e)) => {}
                        }
                        break;
                    }
                }
            }
            debug!(operator = name, batches, "Worker finished");
        });

        self.state = State::Running { rx, handle };
        Ok(())
    }

    /// Join a worker whose channel closed; only a clean exit is end of stream
    async fn join_worker(&mut self) -> QueryResult<Option<StepBatch>> {
        let State::Running { handle, .. } = std::mem::replace(&mut self.state, State::Done) else {
            return Ok(None);
        };
        match handle.await {
            Ok(()) => Ok(None),
            Err(e) if e.is_panic() => {
                warn!(operator = self.inner_name, "Worker panicked");
                metrics::record_operator_error(self.name());
                Err(QueryError::internal(format!(
                    "worker for {} panicked",
                    self.inner_name
                )))
            }
            Err(_) => Err(QueryError::cancelled("exchange worker was aborted")),
        }
    }

    fn finish(&mut self) {
        if let State::Running { handle, .. } = std::mem::replace(&mut self.state, State::Done) {
            handle.abort();
        }
    }
}

#[async_trait]
impl VectorOperator for Concurrent {
    async fn next(&mut self, ctx: &ExecutionContext) -> QueryResult<Option<StepBatch>> {
        ctx.check_cancelled()?;
        if matches!(self.state, State::Idle(_)) {
            self.start(ctx).await?;
        }

        let received = match &mut self.state {
            State::Running { rx, .. } => {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => None,
                    received = rx.recv() => Some(received),
                }
            }
            State::Done => return Ok(None),
            State::Idle(_) => return Err(QueryError::internal("exchange worker was not started")),
        };

        match received {
            None => {
                self.finish();
                Err(QueryError::cancelled("cancelled while waiting for worker"))
            }
            Some(Some(Ok(batch))) => Ok(Some(batch)),
            Some(Some(Err(e))) => {
                self.finish();
                metrics::record_operator_error(self.name());
                Err(e)
            }
            Some(None) => self.join_worker().await,
        }
    }

    async fn series(&mut self, ctx: &ExecutionContext) -> QueryResult<Arc<[Labels]>> {
        if let Some(series) = &self.series {
            return Ok(Arc::clone(series));
        }
        match &mut self.state {
            State::Idle(op) => {
                let series = op.series(ctx).await?;
                self.series = Some(Arc::clone(&series));
                Ok(series)
            }
            _ => Err(QueryError::internal(
                "exchange started without resolving series",
            )),
        }
    }

    fn pool(&self) -> VectorPool {
        self.pool.clone()
    }

    fn name(&self) -> &'static str {
        "concurrent"
    }
}

impl Drop for Concurrent {
    fn drop(&mut self) {
        self.finish();
    }
}

// ============================================================================
// Tests
// ============================================================================
