//! Error types for the execution layer

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Query construction or execution error
    #[error("Query error: {0}")]
    Query(#[from] crate::query::QueryError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`Queryable`](crate::engine::Queryable) backend
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// The backend failed to answer a select call
    #[error("Select failed: {0}")]
    SelectFailed(String),

    /// Samples of a series were not strictly increasing in timestamp
    #[error("Out of order sample at {timestamp} in series {series}")]
    OutOfOrder {
        /// Label set of the series, rendered
        series: String,
        /// First offending timestamp
        timestamp: i64,
    },

    /// The requested time range is inverted
    #[error("Invalid time range: start {start} > end {end}")]
    InvalidTimeRange {
        /// Start timestamp
        start: i64,
        /// End timestamp
        end: i64,
    },
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("Failed to access config file {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`Config`](crate::config::Config)
    #[error("Failed to parse config file {path}: {message}")]
    Parse {
        /// File path
        path: String,
        /// Parser message
        message: String,
    },

    /// Config could not be serialized
    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    /// A field is out of its allowed range
    #[error("{field} value {value} is invalid: {reason}")]
    Invalid {
        /// Field name being validated
        field: &'static str,
        /// The invalid value, rendered
        value: String,
        /// Why it was rejected
        reason: &'static str,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
