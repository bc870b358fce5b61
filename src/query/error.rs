//! Query error types
//!
//! Structured errors for operator construction and pipeline execution.
//! The kind is meant for programmatic handling; the message for humans.

use crate::error::StorageError;
use std::fmt;

/// Query error with context
#[derive(Debug)]
pub struct QueryError {
    /// Error kind for programmatic handling
    pub kind: QueryErrorKind,
    /// Human-readable message
    pub message: String,
    /// Optional source error
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    /// Create a new query error
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Add source error for error chaining
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Create an unsupported expression error
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::NotSupported, message)
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::ValidationError, message)
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Storage, message)
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Cancelled, message)
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Timeout, message)
    }

    /// Create an internal error (broken invariant)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Internal, message)
    }

    /// Whether this error was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind == QueryErrorKind::Cancelled
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        QueryError::storage(err.to_string()).with_source(err)
    }
}

/// Categories of query errors for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Expression or function the engine does not support
    NotSupported,
    /// Invalid options or plan node parameters
    ValidationError,
    /// Storage collaborator failed while selecting or decoding
    Storage,
    /// Query was cancelled through its context
    Cancelled,
    /// Query exceeded its time limit
    Timeout,
    /// Internal error (broken invariant, e.g. misaligned shards)
    Internal,
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::NotSupported => write!(f, "NotSupported"),
            QueryErrorKind::ValidationError => write!(f, "ValidationError"),
            QueryErrorKind::Storage => write!(f, "Storage"),
            QueryErrorKind::Cancelled => write!(f, "Cancelled"),
            QueryErrorKind::Timeout => write!(f, "Timeout"),
            QueryErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

/// Result type alias for query operations
pub type QueryResult<T> = std::result::Result<T, QueryError>;
