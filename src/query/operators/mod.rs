//! Query Operators - step-vector execution primitives
//!
//! This module provides the building blocks for selector execution:
//! - [`StepVector`] / [`StepBatch`]: the columnar unit of data between operators
//! - [`VectorPool`]: recycling of step vectors between producer and consumer
//! - [`VectorOperator`]: the pull contract every operator implements
//! - Vector and matrix selectors that decode one shard of series
//!
//! All operators emit step-aligned batches: each batch is an ordered run of
//! step vectors, one per evaluation timestamp.

pub mod functions;
pub mod matrix_selector;
pub mod vector_selector;
pub mod window;

pub use functions::{FunctionArg, RangeFunction};
pub use matrix_selector::MatrixSelector;
pub use vector_selector::VectorSelector;
pub use window::SampleWindow;

use crate::query::error::QueryResult;
use crate::query::executor::ExecutionContext;
use crate::types::Labels;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Step Vector
// ============================================================================

/// Output of all series of one operator at a single step
///
/// `sample_ids` and `samples` are parallel: `samples[i]` belongs to the
/// series whose id is `sample_ids[i]`. Absent series are simply not listed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepVector {
    /// Step timestamp in milliseconds
    pub t: i64,

    /// Series ids present at this step
    pub sample_ids: Vec<u64>,

    /// Values, parallel to `sample_ids`
    pub samples: Vec<f64>,
}

impl StepVector {
    /// Create an empty step vector at `t`
    pub fn new(t: i64) -> Self {
        Self {
            t,
            sample_ids: Vec::new(),
            samples: Vec::new(),
        }
    }

    /// Add a value for series `id`
    #[inline]
    pub fn push(&mut self, id: u64, value: f64) {
        self.sample_ids.push(id);
        self.samples.push(value);
    }

    /// Number of present series
    #[inline]
    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    /// Whether no series is present
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    /// Drop all contents, keeping allocations
    pub fn clear(&mut self) {
        self.t = 0;
        self.sample_ids.clear();
        self.samples.clear();
    }
}

/// An ordered run of consecutive step vectors
pub type StepBatch = Vec<StepVector>;

// ============================================================================
// Vector Pool
// ============================================================================

/// Upper bound on recycled objects kept per pool
const MAX_POOLED: usize = 1024;

#[derive(Debug, Default)]
struct PoolInner {
    vectors: Mutex<Vec<StepVector>>,
    batches: Mutex<Vec<StepBatch>>,
    step_size: AtomicUsize,
}

/// Shared recycler for step vectors and batches
///
/// Cloning shares the same free lists. Everything put back is cleared before
/// it is stored, so a vector taken from the pool never carries residual data.
#[derive(Debug, Clone, Default)]
pub struct VectorPool {
    inner: Arc<PoolInner>,
}

impl VectorPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the expected number of steps per batch (capacity hint)
    pub fn set_step_size(&self, steps: usize) {
        self.inner.step_size.store(steps, Ordering::Relaxed);
    }

    /// Take an empty batch
    pub fn get_vector_batch(&self) -> StepBatch {
        match self.inner.batches.lock().pop() {
            Some(batch) => batch,
            None => Vec::with_capacity(self.inner.step_size.load(Ordering::Relaxed)),
        }
    }

    /// Take a cleared step vector stamped with `t`
    pub fn get_step_vector(&self, t: i64) -> StepVector {
        match self.inner.vectors.lock().pop() {
            Some(mut vector) => {
                vector.t = t;
                vector
            }
            None => StepVector::new(t),
        }
    }

    /// Return a step vector to the pool
    pub fn put_step_vector(&self, mut vector: StepVector) {
        vector.clear();
        let mut vectors = self.inner.vectors.lock();
        if vectors.len() < MAX_POOLED {
            vectors.push(vector);
        }
    }

    /// Return every vector of a batch, and the batch itself, to the pool
    pub fn put_vectors(&self, mut batch: StepBatch) {
        for vector in batch.drain(..) {
            self.put_step_vector(vector);
        }
        let mut batches = self.inner.batches.lock();
        if batches.len() < MAX_POOLED {
            batches.push(batch);
        }
    }

    /// Number of step vectors currently available for reuse
    pub fn pooled_vectors(&self) -> usize {
        self.inner.vectors.lock().len()
    }
}

// ============================================================================
// Operator Trait
// ============================================================================

/// Common interface for all step-vector operators
///
/// Operators implement a pull-based model where downstream operators
/// request batches from upstream operators.
#[async_trait]
pub trait VectorOperator: Send {
    /// Pull the next batch of step vectors
    ///
    /// Returns:
    /// - `Ok(Some(batch))` - More data available
    /// - `Ok(None)` - No more data (end of stream)
    /// - `Err(e)` - Error occurred
    async fn next(&mut self, ctx: &ExecutionContext) -> QueryResult<Option<StepBatch>>;

    /// Output series, indexed by the sample ids this operator emits
    async fn series(&mut self, ctx: &ExecutionContext) -> QueryResult<Arc<[Labels]>>;

    /// Pool that batches from [`next`](Self::next) should be returned to
    fn pool(&self) -> VectorPool;

    /// Get operator name for debugging/profiling
    fn name(&self) -> &'static str;
}

// ============================================================================
// Numeric Utilities
// ============================================================================

/// Numerically stable accumulation helpers
pub mod numeric {
    /// Compensated summation step (Kahan with the Neumaier improvement)
    ///
    /// Returns `(new_sum, new_compensation)`. The result is `sum + c`.
    #[inline(never)]
    pub fn kahan_inc(inc: f64, sum: f64, c: f64) -> (f64, f64) {
        let t = sum + inc;

        let new_c = if t.is_infinite() {
            0.0
        } else if sum.abs() >= inc.abs() {
            c + ((sum - t) + inc)
        } else {
            c + ((inc - t) + sum)
        };

        (t, new_c)
    }

    /// Kahan summation for accurate floating-point sums
    #[derive(Debug, Clone, Default)]
    pub struct KahanSum {
        sum: f64,
        compensation: f64,
    }

    impl KahanSum {
        /// Create a new sum accumulator
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a value to the sum
        #[inline]
        pub fn add(&mut self, value: f64) {
            (self.sum, self.compensation) = kahan_inc(value, self.sum, self.compensation);
        }

        /// Get the current sum
        #[inline]
        pub fn sum(&self) -> f64 {
            self.sum + self.compensation
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
