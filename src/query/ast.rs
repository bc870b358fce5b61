//! Logical plan nodes consumed by the scan layer
//!
//! These are the selector-shaped leaves of a PromQL plan: label matchers,
//! vector and matrix selectors, and the function call that may wrap a
//! matrix selector. Parsing and optimization live elsewhere; this module
//! only defines what the scanners need to build operators.
//!
//! # Example
//!
//! ```rust
//! use kuba_exec::query::ast::{LabelMatcher, MatrixSelectorNode, VectorSelectorNode};
//!
//! let selector = VectorSelectorNode::new(vec![
//!     LabelMatcher::equal("__name__", "http_requests_total"),
//!     LabelMatcher::regex("code", "5..").unwrap(),
//! ])
//! .with_offset_ms(60_000);
//!
//! let matrix = MatrixSelectorNode::new(selector, 300_000);
//! assert_eq!(matrix.range_ms, 300_000);
//! ```

use crate::query::error::{QueryError, QueryResult};
use crate::types::Labels;
use regex::Regex;
use std::fmt;
use std::hash::{Hash, Hasher};

// ============================================================================
// Label Matchers
// ============================================================================

/// Label matching operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    /// `label = "value"`
    Equal,
    /// `label != "value"`
    NotEqual,
    /// `label =~ "regex"`
    Regex,
    /// `label !~ "regex"`
    NotRegex,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchOp::Equal => write!(f, "="),
            MatchOp::NotEqual => write!(f, "!="),
            MatchOp::Regex => write!(f, "=~"),
            MatchOp::NotRegex => write!(f, "!~"),
        }
    }
}

/// A single label predicate
///
/// Equality and hashing use the matcher's content (name, operator, value),
/// so two independently built matchers for the same predicate are
/// interchangeable as cache keys. The compiled regex is derived state.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    /// Label name to test
    pub name: String,
    /// Match operator
    pub op: MatchOp,
    /// Literal value or regex source
    pub value: String,
    /// Fully anchored compiled regex for `=~` / `!~`
    regex: Option<Regex>,
}

impl LabelMatcher {
    /// Create a matcher, compiling the regex for regex operators
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> QueryResult<Self> {
        let name = name.into();
        let value = value.into();
        let regex = match op {
            MatchOp::Regex | MatchOp::NotRegex => {
                let anchored = format!("^(?:{})$", value);
                let compiled = Regex::new(&anchored).map_err(|e| {
                    QueryError::validation(format!("invalid regex {:?} for label {}", value, name))
                        .with_source(e)
                })?;
                Some(compiled)
            }
            MatchOp::Equal | MatchOp::NotEqual => None,
        };
        Ok(Self {
            name,
            op,
            value,
            regex,
        })
    }

    /// `name = value`
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            regex: None,
        }
    }

    /// `name != value`
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::NotEqual,
            value: value.into(),
            regex: None,
        }
    }

    /// `name =~ pattern`
    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> QueryResult<Self> {
        Self::new(MatchOp::Regex, name, pattern)
    }

    /// `name !~ pattern`
    pub fn not_regex(name: impl Into<String>, pattern: impl Into<String>) -> QueryResult<Self> {
        Self::new(MatchOp::NotRegex, name, pattern)
    }

    /// Test a single label value
    pub fn matches(&self, value: &str) -> bool {
        match self.op {
            MatchOp::Equal => self.value == value,
            MatchOp::NotEqual => self.value != value,
            MatchOp::Regex => self.regex.as_ref().is_some_and(|r| r.is_match(value)),
            MatchOp::NotRegex => !self.regex.as_ref().is_some_and(|r| r.is_match(value)),
        }
    }

    /// Test a label set; a missing label matches as the empty string
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name).unwrap_or(""))
    }
}

impl PartialEq for LabelMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl Eq for LabelMatcher {}

impl Hash for LabelMatcher {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.op.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// Check a label set against every matcher
pub fn matches_all(matchers: &[LabelMatcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches_labels(labels))
}

// ============================================================================
// Selector Nodes
// ============================================================================

/// Instant vector selector, e.g. `http_requests_total{job="api"} offset 1m`
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelectorNode {
    /// Matchers sent to storage
    pub matchers: Vec<LabelMatcher>,

    /// Matchers applied after storage returns (pushed down by the optimizer)
    pub filters: Vec<LabelMatcher>,

    /// Offset in milliseconds; positive values look into the past
    pub offset_ms: i64,

    /// Maximum series per emitted batch (0 = unbounded)
    pub batch_size: usize,

    /// Emit the sample timestamp (seconds) instead of its value
    pub select_timestamp: bool,
}

impl VectorSelectorNode {
    /// Create a selector from storage matchers
    pub fn new(matchers: Vec<LabelMatcher>) -> Self {
        Self {
            matchers,
            filters: Vec::new(),
            offset_ms: 0,
            batch_size: 0,
            select_timestamp: false,
        }
    }

    /// Add post-select filters
    pub fn with_filters(mut self, filters: Vec<LabelMatcher>) -> Self {
        self.filters = filters;
        self
    }

    /// Set the offset in milliseconds
    pub fn with_offset_ms(mut self, offset_ms: i64) -> Self {
        self.offset_ms = offset_ms;
        self
    }

    /// Bound the number of series per emitted batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Emit sample timestamps instead of values
    pub fn selecting_timestamp(mut self) -> Self {
        self.select_timestamp = true;
        self
    }
}

impl fmt::Display for VectorSelectorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, m) in self.matchers.iter().chain(self.filters.iter()).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", m)?;
        }
        write!(f, "}}")?;
        if self.offset_ms != 0 {
            write!(f, " offset {}ms", self.offset_ms)?;
        }
        Ok(())
    }
}

/// Range vector selector, e.g. `http_requests_total[5m]`
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelectorNode {
    /// The wrapped instant selector
    pub vector_selector: VectorSelectorNode,
    /// Window width in milliseconds
    pub range_ms: i64,
}

impl MatrixSelectorNode {
    /// Create a matrix selector over `range_ms`
    pub fn new(vector_selector: VectorSelectorNode, range_ms: i64) -> Self {
        Self {
            vector_selector,
            range_ms,
        }
    }
}

impl fmt::Display for MatrixSelectorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}ms]", self.vector_selector, self.range_ms)
    }
}

// ============================================================================
// Function Calls and Arguments
// ============================================================================

/// Function call node wrapping a matrix selector, e.g. `rate(x[5m])`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Function name
    pub name: String,
    /// Call arguments in source order (the matrix selector included)
    pub args: Vec<Expr>,
}

impl FunctionCall {
    /// Create a call node
    pub fn new(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Expression arguments a function call may carry
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    NumberLiteral(f64),
    /// String literal
    StringLiteral(String),
    /// Parenthesized expression
    Paren(Box<Expr>),
    /// Unary minus
    Negation(Box<Expr>),
    /// Range selector argument
    MatrixSelector(MatrixSelectorNode),
    /// Instant selector argument
    VectorSelector(VectorSelectorNode),
    /// Nested function call
    Call(FunctionCall),
}

impl Expr {
    /// Resolve a constant float, looking through parentheses and negation
    pub fn unwrap_float(&self) -> QueryResult<f64> {
        match self {
            Expr::NumberLiteral(v) => Ok(*v),
            Expr::Paren(inner) => inner.unwrap_float(),
            Expr::Negation(inner) => inner.unwrap_float().map(|v| -v),
            other => Err(QueryError::not_supported(format!(
                "expected a number literal, got {}",
                other.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Expr::NumberLiteral(_) => "number literal",
            Expr::StringLiteral(_) => "string literal",
            Expr::Paren(_) => "parenthesized expression",
            Expr::Negation(_) => "unary expression",
            Expr::MatrixSelector(_) => "matrix selector",
            Expr::VectorSelector(_) => "vector selector",
            Expr::Call(_) => "function call",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
