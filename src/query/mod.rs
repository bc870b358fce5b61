//! Query layer: selector resolution, sharded decoding and exchanges
//!
//! This module turns PromQL selector nodes into pull-based pipelines of
//! step-aligned batches:
//! - Selector resolution cached per query, one storage select per key
//! - Instant (vector) and windowed (matrix) selectors over disjoint shards
//! - Exchanges that run shards on worker tasks and merge them back
//!
//! # Architecture
//!
//! ```text
//! Selector node
//!      │
//!      ▼
//! ┌─────────────┐
//! │  Scanners   │  Build N shards for the node
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │ SelectorPool│  Resolve matching series once
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Shards    │  Decode steps, one worker task each
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │  Coalesce   │  Step-aligned merge
//! └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kuba_exec::engine::InMemoryStorage;
//! use kuba_exec::query::{
//!     ast::{LabelMatcher, VectorSelectorNode},
//!     scanners::{vector_selector_hints, Scanners},
//!     ExecutionContext, QueryExecutor, QueryOptions,
//! };
//!
//! let scanners = Scanners::new(Arc::new(storage));
//! let opts = QueryOptions::range(start, end, 15_000);
//! let node = VectorSelectorNode::new(vec![LabelMatcher::equal("__name__", "up")]);
//!
//! let op = scanners.new_vector_selector(&opts, &vector_selector_hints(&opts, &node), &node)?;
//! let result = QueryExecutor::new()
//!     .execute_operator(op, &ExecutionContext::default())
//!     .await?;
//! ```

pub mod ast;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod operators;
pub mod scanners;
pub mod selector;

// Re-export main types
pub use ast::{Expr, FunctionCall, LabelMatcher, MatchOp, MatrixSelectorNode, VectorSelectorNode};
pub use error::{QueryError, QueryErrorKind, QueryResult};
pub use exchange::{Coalesce, Concurrent};
pub use executor::{
    ExecutionContext, ExecutorConfig, QueryExecutor, QueryOptions, RangeResult, RangeSeries,
};
pub use operators::{StepBatch, StepVector, VectorOperator, VectorPool};
pub use scanners::Scanners;
pub use selector::{SelectorPool, SeriesSelector};
