//! Query Executor - drives a step-vector pipeline to completion
//!
//! This module provides the execution infrastructure around the scan layer:
//! - [`QueryOptions`]: the evaluation range and tuning knobs shared by all operators
//! - [`ExecutionContext`]: cancellation and deadline shared by every stage and worker
//! - [`QueryExecutor`]: drains an operator tree into a [`RangeResult`]
//!
//! # Architecture
//!
//! The executor follows a pull-based model over batched step vectors:
//!
//! ```text
//! ┌─────────────────┐
//! │  QueryExecutor  │  ← Drains batches into a RangeResult
//! └────────┬────────┘
//!          │ pull batches
//! ┌────────▼────────┐
//! │    Coalesce     │  ← N-way step-aligned merge
//! └────────┬────────┘
//!          │ pull batches (all shards at once)
//! ┌────────▼────────┐
//! │   Concurrent    │  ← One worker task per shard, bounded buffer
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ Vector / Matrix │  ← Decode a disjoint shard of the series
//! │    Selector     │
//! └─────────────────┘
//! ```
//!
//! # Cancellation
//!
//! The context carries a [`CancellationToken`]. Cancelling it (explicitly or
//! when the deadline passes inside [`QueryExecutor::execute_operator`])
//! unblocks every worker and consumer in the pipeline.

use crate::query::error::{QueryError, QueryResult};
use crate::query::operators::VectorOperator;
use crate::types::Labels;
use std::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

/// Default staleness horizon for instant selection (5 minutes)
pub const DEFAULT_LOOKBACK_DELTA_MS: i64 = 5 * 60 * 1000;

/// Default number of steps emitted per batch
pub const DEFAULT_STEPS_BATCH: usize = 10;

/// Default query timeout (2 minutes)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Query Options
// ============================================================================

/// Evaluation range and tuning knobs for one query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// First step timestamp in milliseconds (inclusive)
    pub start_ms: i64,

    /// Last step timestamp in milliseconds (inclusive)
    pub end_ms: i64,

    /// Step interval in milliseconds (0 is evaluated as 1)
    pub step_ms: i64,

    /// How far back an instant selector looks for a sample
    pub lookback_delta_ms: i64,

    /// Steps emitted per batch
    pub steps_batch: usize,

    /// Number of shards (and worker tasks) per selector
    pub decoding_concurrency: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            start_ms: 0,
            end_ms: 0,
            step_ms: 0,
            lookback_delta_ms: DEFAULT_LOOKBACK_DELTA_MS,
            steps_batch: DEFAULT_STEPS_BATCH,
            decoding_concurrency: default_decoding_concurrency(),
        }
    }
}

/// Available parallelism, at least 1
pub fn default_decoding_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl QueryOptions {
    /// Options for a range query
    pub fn range(start_ms: i64, end_ms: i64, step_ms: i64) -> Self {
        Self {
            start_ms,
            end_ms,
            step_ms,
            ..Default::default()
        }
    }

    /// Options for an instant query at `t_ms`
    pub fn instant(t_ms: i64) -> Self {
        Self::range(t_ms, t_ms, 0)
    }

    /// Set the lookback delta
    pub fn with_lookback_delta_ms(mut self, lookback_ms: i64) -> Self {
        self.lookback_delta_ms = lookback_ms;
        self
    }

    /// Set steps per batch
    pub fn with_steps_batch(mut self, steps: usize) -> Self {
        self.steps_batch = steps;
        self
    }

    /// Set the number of decoding shards
    pub fn with_decoding_concurrency(mut self, shards: usize) -> Self {
        self.decoding_concurrency = shards;
        self
    }

    /// Step interval used for iteration (never 0)
    #[inline]
    pub fn effective_step_ms(&self) -> i64 {
        self.step_ms.max(1)
    }

    /// Total number of steps in `[start, end]`
    pub fn num_steps(&self) -> usize {
        if self.end_ms < self.start_ms {
            return 0;
        }
        ((self.end_ms - self.start_ms) / self.effective_step_ms()) as usize + 1
    }

    /// Validate the options
    pub fn validate(&self) -> QueryResult<()> {
        if self.end_ms < self.start_ms {
            return Err(QueryError::validation(format!(
                "end {} is before start {}",
                self.end_ms, self.start_ms
            )));
        }
        if self.step_ms < 0 {
            return Err(QueryError::validation(format!(
                "step must not be negative, got {}",
                self.step_ms
            )));
        }
        if self.step_ms == 0 && self.end_ms != self.start_ms {
            return Err(QueryError::validation(
                "step 0 is only valid for instant queries",
            ));
        }
        if self.lookback_delta_ms <= 0 {
            return Err(QueryError::validation(format!(
                "lookback delta must be positive, got {}",
                self.lookback_delta_ms
            )));
        }
        if self.steps_batch == 0 {
            return Err(QueryError::validation("steps_batch must be at least 1"));
        }
        if self.decoding_concurrency == 0 {
            return Err(QueryError::validation(
                "decoding_concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Executor Configuration
// ============================================================================

/// Configuration for draining a pipeline
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Query timeout duration (default: 2 minutes)
    pub timeout: Duration,

    /// Maximum number of points in a result (default: 50_000_000)
    pub max_result_points: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_result_points: 50_000_000,
        }
    }
}

impl ExecutorConfig {
    /// Create a new executor config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set query timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set maximum result points
    pub fn with_max_result_points(mut self, points: usize) -> Self {
        self.max_result_points = points;
        self
    }
}

// ============================================================================
// Query Executor
// ============================================================================

/// Drains operator trees and keeps running statistics
pub struct QueryExecutor {
    /// Executor configuration
    config: ExecutorConfig,

    /// Execution statistics for monitoring
    stats: ExecutionStats,
}

impl QueryExecutor {
    /// Create a new query executor with default configuration
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::default())
    }

    /// Create a query executor with custom configuration
    pub fn with_config(config: ExecutorConfig) -> Self {
        Self {
            config,
            stats: ExecutionStats::default(),
        }
    }

    /// Create a context whose deadline follows this executor's timeout
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(self.config.timeout)
    }

    /// Get current execution statistics
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Reset execution statistics
    pub fn reset_stats(&mut self) {
        self.stats = ExecutionStats::default();
    }

    /// Get executor configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute an operator tree and collect its output per series
    ///
    /// Every pulled step vector is returned to the operator's pool once its
    /// points are copied out. When the context deadline passes the context
    /// is cancelled, so every worker below stops, and a `Timeout` error is
    /// returned.
    ///
    /// # Returns
    ///
    /// * `Ok(RangeResult)` - Points per series, in series order
    /// * `Err(QueryError)` - The first error raised anywhere in the tree
    pub async fn execute_operator(
        &mut self,
        mut operator: Box<dyn VectorOperator>,
        ctx: &ExecutionContext,
    ) -> QueryResult<RangeResult> {
        let start = Instant::now();
        self.stats.total_queries += 1;

        if ctx.timeout.is_zero() {
            return Err(QueryError::timeout("Query timeout is zero"));
        }

        let drained = tokio::time::timeout(
            ctx.remaining_time(),
            self.drain(operator.as_mut(), ctx),
        )
        .await;

        let duration = start.elapsed();
        self.stats.total_execution_time += duration;

        match drained {
            Ok(Ok(result)) => {
                debug!(
                    operator = operator.name(),
                    series = result.series.len(),
                    points = result.total_points(),
                    elapsed_ms = duration.as_millis() as u64,
                    "Pipeline drained"
                );
                Ok(result)
            }
            Ok(Err(e)) => {
                warn!(operator = operator.name(), error = %e, "Pipeline failed");
                Err(e)
            }
            Err(_) => {
                ctx.cancel();
                warn!(
                    operator = operator.name(),
                    timeout_ms = ctx.timeout.as_millis() as u64,
                    "Query timed out, cancelling pipeline"
                );
                Err(QueryError::timeout("Query execution timed out"))
            }
        }
    }

    async fn drain(
        &mut self,
        operator: &mut dyn VectorOperator,
        ctx: &ExecutionContext,
    ) -> QueryResult<RangeResult> {
        let series = operator.series(ctx).await?;
        let pool = operator.pool();

        let mut points: Vec<Vec<(i64, f64)>> = vec![Vec::new(); series.len()];
        let mut total = 0usize;
        let mut truncated = false;

        'pull: while let Some(batch) = operator.next(ctx).await? {
            self.stats.batches += 1;
            for vector in batch.iter() {
                self.stats.step_vectors += 1;
                for (&id, &value) in vector.sample_ids.iter().zip(vector.samples.iter()) {
                    let slot = points.get_mut(id as usize).ok_or_else(|| {
                        QueryError::internal(format!(
                            "sample id {} out of range for {} series",
                            id,
                            series.len()
                        ))
                    })?;
                    slot.push((vector.t, value));
                    total += 1;
                }
            }
            pool.put_vectors(batch);

            if total >= self.config.max_result_points {
                truncated = true;
                break 'pull;
            }
        }

        self.stats.points_returned += total as u64;

        Ok(RangeResult {
            series: series
                .iter()
                .cloned()
                .zip(points)
                .filter(|(_, pts)| !pts.is_empty())
                .map(|(labels, points)| RangeSeries { labels, points })
                .collect(),
            truncated,
        })
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Points of one output series
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSeries {
    /// Series labels as reported by the operator
    pub labels: Labels,
    /// `(step timestamp ms, value)` in step order
    pub points: Vec<(i64, f64)>,
}

/// Drained output of an operator tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeResult {
    /// Series with at least one point, in operator series order
    pub series: Vec<RangeSeries>,
    /// Whether collection stopped at the configured point limit
    pub truncated: bool,
}

impl RangeResult {
    /// Look up a series by labels
    pub fn get(&self, labels: &Labels) -> Option<&RangeSeries> {
        self.series.iter().find(|s| &s.labels == labels)
    }

    /// Total points across all series
    pub fn total_points(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }

    /// Number of series with output
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether no series produced output
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

// ============================================================================
// Execution Statistics
// ============================================================================

/// Statistics collected during execution for monitoring
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    /// Total number of pipelines executed
    pub total_queries: u64,

    /// Total execution time across all pipelines
    pub total_execution_time: Duration,

    /// Step batches pulled from the root operator
    pub batches: u64,

    /// Step vectors pulled from the root operator
    pub step_vectors: u64,

    /// Points copied into results
    pub points_returned: u64,
}

impl ExecutionStats {
    /// Calculate average pipeline latency
    pub fn avg_query_latency(&self) -> Duration {
        if self.total_queries == 0 {
            Duration::ZERO
        } else {
            self.total_execution_time / self.total_queries.min(u32::MAX as u64) as u32
        }
    }

    /// Average points per step vector
    pub fn points_per_step(&self) -> f64 {
        if self.step_vectors == 0 {
            0.0
        } else {
            self.points_returned as f64 / self.step_vectors as f64
        }
    }
}

// ============================================================================
// Execution Context
// ============================================================================

/// Context passed through the execution pipeline
///
/// Cloning shares the same cancellation token; [`child`](Self::child) creates
/// a token that is cancelled with its parent but can also be cancelled alone.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Query start time for timeout checking
    pub start_time: Instant,

    /// Timeout duration
    pub timeout: Duration,

    token: CancellationToken,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ExecutionContext {
    /// Create a new context with a fresh token
    pub fn new(timeout: Duration) -> Self {
        Self::with_token(timeout, CancellationToken::new())
    }

    /// Create a context around an existing token
    pub fn with_token(timeout: Duration, token: CancellationToken) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
            token,
        }
    }

    /// Derive a context whose token is a child of this one
    pub fn child(&self) -> Self {
        Self {
            start_time: self.start_time,
            timeout: self.timeout,
            token: self.token.child_token(),
        }
    }

    /// Cancel execution
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether execution has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Future that resolves once the context is cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The underlying cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Return a `Cancelled` error if the context was cancelled
    pub fn check_cancelled(&self) -> QueryResult<()> {
        if self.is_cancelled() {
            Err(QueryError::cancelled("query was cancelled"))
        } else {
            Ok(())
        }
    }

    /// Check if query has timed out
    pub fn is_timed_out(&self) -> bool {
        self.start_time.elapsed() > self.timeout
    }

    /// Get remaining time before timeout
    pub fn remaining_time(&self) -> Duration {
        self.timeout.saturating_sub(self.start_time.elapsed())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_options_defaults() {
        let opts = QueryOptions::default();
        assert_eq!(opts.lookback_delta_ms, 300_000);
        assert_eq!(opts.steps_batch, 10);
        assert!(opts.decoding_concurrency >= 1);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_num_steps() {
        assert_eq!(QueryOptions::range(0, 100, 10).num_steps(), 11);
        assert_eq!(QueryOptions::range(0, 105, 10).num_steps(), 11);
        assert_eq!(QueryOptions::instant(50).num_steps(), 1);
    }

    #[test]
    fn test_query_options_validation() {
        assert!(QueryOptions::range(10, 0, 1).validate().is_err());
        assert!(QueryOptions::range(0, 10, -1).validate().is_err());
        assert!(QueryOptions::range(0, 3_600_000, 0).validate().is_err());
        assert!(QueryOptions::range(100, 100, 0).validate().is_ok());
        assert!(QueryOptions::instant(100).validate().is_ok());
        assert!(QueryOptions::range(0, 10, 1)
            .with_steps_batch(0)
            .validate()
            .is_err());
        assert!(QueryOptions::range(0, 10, 1)
            .with_decoding_concurrency(0)
            .validate()
            .is_err());
        assert!(QueryOptions::range(0, 10, 1)
            .with_lookback_delta_ms(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_executor_config_builder() {
        let config = ExecutorConfig::new()
            .with_timeout(Duration::from_secs(60))
            .with_max_result_points(10);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_result_points, 10);
    }

    #[test]
    fn test_execution_stats() {
        let stats = ExecutionStats {
            total_queries: 2,
            total_execution_time: Duration::from_millis(100),
            step_vectors: 10,
            points_returned: 40,
            ..Default::default()
        };
        assert_eq!(stats.avg_query_latency(), Duration::from_millis(50));
        assert!((stats.points_per_step() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_context_cancellation_reaches_children() {
        let ctx = ExecutionContext::default();
        let child = ctx.child();
        let clone = ctx.clone();

        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel();
        assert!(child.is_cancelled());
        assert!(clone.is_cancelled());
        assert!(child.check_cancelled().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let ctx = ExecutionContext::default();
        let child = ctx.child();
        child.cancel();
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_timeout_tracking() {
        let ctx = ExecutionContext::new(Duration::from_secs(3600));
        assert!(!ctx.is_timed_out());
        assert!(ctx.remaining_time() > Duration::from_secs(3500));
    }
}
