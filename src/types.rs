//! Core data types shared by the selectors and exchanges
//!
//! # Key Types
//!
//! - **`Sample`**: a single raw measurement (timestamp in ms + value)
//! - **`Label`** / **`Labels`**: the sorted label set identifying a series
//! - **`TimeRange`**: an inclusive query window
//!
//! # Example
//!
//! ```rust
//! use kuba_exec::types::{Labels, Sample, TimeRange};
//!
//! let labels = Labels::from_pairs(&[("__name__", "http_requests_total"), ("job", "api")]);
//! assert_eq!(labels.metric_name(), Some("http_requests_total"));
//!
//! let sample = Sample::new(1_000, 42.5);
//! let range = TimeRange::new(0, 2_000).unwrap();
//! assert!(range.contains(sample.timestamp));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the label carrying the metric name
pub const METRIC_NAME: &str = "__name__";

/// Bit pattern Prometheus uses to mark a series as stale
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// Returns the staleness marker value
#[inline]
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

/// Check whether a value is the staleness marker (not just any NaN)
#[inline]
pub fn is_stale_nan(value: f64) -> bool {
    value.to_bits() == STALE_NAN_BITS
}

/// A single raw sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp in milliseconds
    pub timestamp: i64,
    /// Sample value
    pub value: f64,
}

impl Sample {
    /// Create a new sample
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A single label pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Label value
    pub value: String,
}

impl Label {
    /// Create a new label pair
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Sorted set of labels identifying a series
///
/// Labels are kept sorted by name so that equality and hashing are
/// independent of construction order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Create a label set, sorting and deduplicating by name (last value wins)
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.reverse();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|a, b| a.name == b.name);
        Self(labels)
    }

    /// Create a label set from string pairs
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect())
    }

    /// Get the value of a label, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Get the metric name, if present
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    /// Copy of this label set without the metric name
    pub fn without_metric_name(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|l| l.name != METRIC_NAME)
                .cloned()
                .collect(),
        )
    }

    /// Iterate over the label pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Number of label pairs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the label set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<I: IntoIterator<Item = Label>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Inclusive time window in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp in milliseconds (inclusive)
    pub start: i64,

    /// End timestamp in milliseconds (inclusive)
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range, rejecting `start > end`
    pub fn new(start: i64, end: i64) -> Result<Self, crate::error::StorageError> {
        if start > end {
            return Err(crate::error::StorageError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Check if a timestamp falls within this range (inclusive)
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Check whether two ranges share at least one timestamp
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Duration of the range in milliseconds, `None` on overflow
    pub fn duration_ms(&self) -> Option<i64> {
        self.end.checked_sub(self.start)
    }
}
