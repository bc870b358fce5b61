//! Property Tests for Sharding and Windowing
//!
//! Uses property-based testing (proptest) to check the partition and window
//! invariants the selector operators rely on.

use kuba_exec::query::operators::SampleWindow;
use kuba_exec::query::selector::{shard_len, shard_series, ResolvedSeries};
use kuba_exec::types::{Labels, Sample};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

// =============================================================================
// Test Data Strategies
// =============================================================================

/// Strategy for generating strictly increasing timestamps
fn timestamp_sequence(max_len: usize) -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(1i64..5_000, 0..max_len).prop_map(|deltas| {
        let mut result = Vec::with_capacity(deltas.len());
        let mut current = 0i64;
        for delta in deltas {
            current += delta;
            result.push(current);
        }
        result
    })
}

fn make_series(n: usize) -> Vec<ResolvedSeries> {
    (0..n)
        .map(|i| ResolvedSeries {
            labels: Labels::from_pairs(&[("ordinal", i.to_string().as_str())]),
            samples: Arc::from(Vec::<Sample>::new()),
        })
        .collect()
}

// =============================================================================
// Shard Partition
// =============================================================================

mod shard_partition {
    use super::*;

    proptest! {
        /// Every series lands in exactly one shard, at ordinal mod shards
        #[test]
        fn shards_form_disjoint_complete_cover(
            total in 0usize..200,
            shards in 1usize..17,
        ) {
            let all = make_series(total);
            let mut seen = HashSet::new();

            for shard in 0..shards {
                let part = shard_series(&all, shard, shards);
                prop_assert_eq!(part.len(), shard_len(total, shard, shards));

                for (position, s) in part.iter().enumerate() {
                    let ordinal: usize = s.labels.get("ordinal").unwrap().parse().unwrap();
                    prop_assert_eq!(ordinal % shards, shard);
                    prop_assert_eq!(s.signature, position as u64);
                    prop_assert!(seen.insert(ordinal), "series {} in two shards", ordinal);
                }
            }

            prop_assert_eq!(seen.len(), total);
        }

        /// Repeated sharding is stable
        #[test]
        fn sharding_is_deterministic(total in 0usize..100, shards in 1usize..9) {
            let all = make_series(total);
            for shard in 0..shards {
                prop_assert_eq!(
                    shard_series(&all, shard, shards),
                    shard_series(&all, shard, shards)
                );
            }
        }
    }
}

// =============================================================================
// Sliding Window
// =============================================================================

mod sliding_window {
    use super::*;

    proptest! {
        /// After every advance the window is exactly the closed range
        #[test]
        fn window_matches_closed_range_filter(
            timestamps in timestamp_sequence(300),
            range in 0i64..20_000,
            step in 1i64..7_000,
            offset in 0i64..3_000,
        ) {
            let raw: Vec<Sample> = timestamps
                .iter()
                .map(|&t| Sample::new(t, t as f64))
                .collect();
            let last = timestamps.last().copied().unwrap_or(0);

            let mut window = SampleWindow::new();
            let mut t = 0i64;
            while t <= last + range + offset + step {
                let maxt = t - offset;
                let mint = maxt - range;
                window.advance(&raw, mint, maxt);

                let expected: Vec<Sample> = raw
                    .iter()
                    .copied()
                    .filter(|s| s.timestamp >= mint && s.timestamp <= maxt)
                    .collect();
                prop_assert_eq!(window.samples(), expected.as_slice());
                t += step;
            }
        }
    }
}
