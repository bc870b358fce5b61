//! Sliding sample window for range selection
//!
//! A [`SampleWindow`] holds the samples of one series that fall in the
//! closed range `[mint, maxt]` of the current step. Moving to the next step
//! drops samples from the front and appends from a read cursor into the raw
//! series, so each raw sample is visited exactly once per query.

use crate::types::{is_stale_nan, Sample};
use std::collections::VecDeque;

/// Per-series window state for a matrix selector
#[derive(Debug, Clone, Default)]
pub struct SampleWindow {
    samples: VecDeque<Sample>,
    cursor: usize,
}

impl SampleWindow {
    /// Create an empty window positioned at the start of the series
    pub fn new() -> Self {
        Self::default()
    }

    /// Slide the window to `[mint, maxt]` over the sorted `raw` samples
    ///
    /// Bounds must not move backwards between calls. Staleness markers are
    /// never added to the window.
    pub fn advance(&mut self, raw: &[Sample], mint: i64, maxt: i64) {
        while self
            .samples
            .front()
            .is_some_and(|s| s.timestamp < mint)
        {
            self.samples.pop_front();
        }

        while let Some(sample) = raw.get(self.cursor) {
            if sample.timestamp > maxt {
                break;
            }
            self.cursor += 1;
            if sample.timestamp < mint || is_stale_nan(sample.value) {
                continue;
            }
            self.samples.push_back(*sample);
        }
    }

    /// Current window contents in timestamp order
    pub fn samples(&mut self) -> &[Sample] {
        self.samples.make_contiguous()
    }

    /// Number of samples in the window
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Index of the next raw sample not yet considered
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::stale_nan;

    fn raw(points: &[(i64, f64)]) -> Vec<Sample> {
        points.iter().map(|&(t, v)| Sample::new(t, v)).collect()
    }

    fn timestamps(window: &mut SampleWindow) -> Vec<i64> {
        window.samples().iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_window_bounds_are_closed() {
        let raw = raw(&[(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]);
        let mut window = SampleWindow::new();

        window.advance(&raw, 10, 20);
        assert_eq!(timestamps(&mut window), vec![10, 20]);

        window.advance(&raw, 20, 30);
        assert_eq!(timestamps(&mut window), vec![20, 30]);
        assert_eq!(window.cursor(), 4);
    }

    #[test]
    fn test_window_skips_samples_before_first_range() {
        let raw = raw(&[(0, 1.0), (5, 2.0), (50, 3.0)]);
        let mut window = SampleWindow::new();

        window.advance(&raw, 40, 60);
        assert_eq!(timestamps(&mut window), vec![50]);
    }

    #[test]
    fn test_window_excludes_stale_markers() {
        let raw = raw(&[(0, 1.0), (10, stale_nan()), (20, f64::NAN)]);
        let mut window = SampleWindow::new();

        window.advance(&raw, 0, 30);
        assert_eq!(window.len(), 2);
        // A plain NaN is data, not a staleness marker
        assert!(window.samples()[1].value.is_nan());
    }

    #[test]
    fn test_window_can_become_empty() {
        let raw = raw(&[(0, 1.0), (100, 2.0)]);
        let mut window = SampleWindow::new();

        window.advance(&raw, 0, 10);
        assert_eq!(window.len(), 1);
        window.advance(&raw, 40, 50);
        assert!(window.is_empty());
        window.advance(&raw, 90, 100);
        assert_eq!(timestamps(&mut window), vec![100]);
    }
}
