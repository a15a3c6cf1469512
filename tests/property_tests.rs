//! Property Tests for Folding and Watermarks
//!
//! Uses proptest to check that rolling up through intermediate tiers gives
//! the same answer as folding raw samples directly, and that watermarks
//! never move backwards however refreshes are sliced.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use vitals_rollup::rollup::record::{fold_records, fold_samples};
use vitals_rollup::rollup::{
    AggregationField, CancellationToken, MetricDefinition, Reducer, RollupEngine, TierDefinition,
    Watermark,
};
use vitals_rollup::storage::{AggregateStore, InMemoryAggregateStore, InMemoryRawStore};
use vitals_rollup::types::{align_down, RawSample, TierKey, TimeRange, DAY_MS, HOUR_MS, MINUTE_MS};

// =============================================================================
// Strategies
// =============================================================================

/// Typical vital-sign readings, including zero
fn reading() -> impl Strategy<Value = f64> {
    prop_oneof![
        (30.0..220.0f64),
        (80.0..100.0f64),
        Just(0.0),
        (0i32..200).prop_map(|i| i as f64),
    ]
}

/// Samples on a minute grid within the first two days
fn samples(max_len: usize) -> impl Strategy<Value = Vec<RawSample>> {
    prop::collection::btree_map(0i64..2 * 1440, reading(), 1..max_len).prop_map(|by_minute| {
        by_minute
            .into_iter()
            .map(|(minute, value)| RawSample::single(minute * MINUTE_MS, value))
            .collect()
    })
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn definition() -> MetricDefinition {
    let reducers = [Reducer::Avg, Reducer::Min, Reducer::Max, Reducer::Sum, Reducer::Count];
    let tier = |id: &str, width: i64| TierDefinition {
        id: id.to_string(),
        bucket_width_ms: width,
        aggregation_fields: vec![AggregationField::new("value", &reducers)],
    };
    MetricDefinition {
        name: "hr".to_string(),
        cadence_ms: MINUTE_MS,
        tiers: vec![tier("15m", 15 * MINUTE_MS), tier("1h", HOUR_MS), tier("1d", DAY_MS)],
    }
}

// =============================================================================
// Fold Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_hourly_then_daily_matches_direct_fold(samples in samples(400)) {
        let fields = vec!["value".to_string()];

        let mut by_hour: BTreeMap<i64, Vec<&RawSample>> = BTreeMap::new();
        for sample in &samples {
            by_hour.entry(align_down(sample.timestamp, HOUR_MS)).or_default().push(sample);
        }
        let hourly: Vec<_> = by_hour
            .iter()
            .filter_map(|(start, group)| {
                fold_samples("hr", "1h", "u", *start, &fields, group.iter().copied())
            })
            .collect();

        let day_zero: Vec<_> = hourly.iter().filter(|r| r.bucket_start < DAY_MS).collect();
        let rolled = fold_records("1d", 0, &fields, day_zero.iter().copied());
        let direct = fold_samples(
            "hr",
            "1d",
            "u",
            0,
            &fields,
            samples.iter().filter(|s| s.timestamp < DAY_MS),
        );

        match (rolled, direct) {
            (None, None) => {},
            (Some(rolled), Some(direct)) => {
                prop_assert_eq!(rolled.sample_count, direct.sample_count);
                let r = rolled.fields["value"];
                let d = direct.fields["value"];
                prop_assert_eq!(r.count, d.count);
                prop_assert_eq!(r.min, d.min);
                prop_assert_eq!(r.max, d.max);
                prop_assert!(close(r.sum, d.sum), "sum {} vs {}", r.sum, d.sum);
                prop_assert!(close(r.avg, d.avg), "avg {} vs {}", r.avg, d.avg);
            },
            (rolled, direct) => {
                prop_assert!(false, "presence differs: {:?} vs {:?}", rolled, direct);
            },
        }
    }

    #[test]
    fn prop_advanced_watermark_only_widens(
        pieces in prop::collection::vec((0i64..100, 1i64..10), 1..20),
        frontiers in prop::collection::vec(0i64..1000, 20),
    ) {
        let mut current: Option<Watermark> = None;
        for (i, (start, len)) in pieces.into_iter().enumerate() {
            let piece = TimeRange::new_unchecked(start * HOUR_MS, (start + len) * HOUR_MS);
            let next = Watermark::advanced(current.as_ref(), piece, Some(frontiers[i] * HOUR_MS));

            prop_assert!(next.materialized_from <= piece.start);
            prop_assert!(next.materialized_through >= piece.end);
            if let Some(prev) = current {
                prop_assert!(next.materialized_from <= prev.materialized_from);
                prop_assert!(next.materialized_through >= prev.materialized_through);
                prop_assert!(next.source_watermark >= prev.source_watermark);
            }
            current = Some(next);
        }
    }

    #[test]
    fn prop_alignment_brackets_range(start in -10_000i64..10_000, len in 1i64..10_000, width in 1i64..500) {
        let range = TimeRange::new_unchecked(start, start + len);

        let outward = range.align_outward(width);
        prop_assert!(outward.start <= range.start && outward.end >= range.end);
        prop_assert_eq!(outward.start.rem_euclid(width), 0);
        prop_assert_eq!(outward.end.rem_euclid(width), 0);
        prop_assert_eq!(outward.bucket_count(width), range.buckets(width).count() as u64);

        let starts = range.bucket_starts_within(width);
        prop_assert!(starts.start >= range.start);
        prop_assert!(starts.start - range.start < width);
        prop_assert_eq!(starts.start.rem_euclid(width), 0);
    }
}

// =============================================================================
// Engine Properties
// =============================================================================

async fn daily_after(samples: &[RawSample], cuts: &[i64]) -> (Vec<Option<Watermark>>, Vec<f64>) {
    let raw = Arc::new(InMemoryRawStore::new());
    raw.append("hr", "u", samples.iter().cloned());
    let store = Arc::new(InMemoryAggregateStore::new());
    let engine = RollupEngine::builder()
        .with_metric(definition())
        .with_raw_store(raw)
        .with_aggregate_store(store.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    // Refresh the finest tier in slices first, then roll everything up
    let mut previous: Option<i64> = None;
    for &cut in cuts {
        let range = TimeRange::new_unchecked(0, cut * 15 * MINUTE_MS);
        match engine.scheduler().refresh("hr", "15m", "u", Some(range), false, &cancel).await {
            Ok(_) => {},
            Err(e) => assert_eq!(e.exit_code(), 5, "unexpected error {}", e),
        }
        let through = store
            .watermark(&TierKey::new("hr", "15m", "u"))
            .await
            .unwrap()
            .map(|w| w.materialized_through);
        if let (Some(before), Some(after)) = (previous, through) {
            assert!(after >= before);
        }
        previous = through.or(previous);
    }
    engine
        .scheduler()
        .refresh("hr", "1d", "u", None, false, &cancel)
        .await
        .unwrap();

    let mut watermarks = Vec::new();
    for tier in ["15m", "1h", "1d"] {
        watermarks.push(store.watermark(&TierKey::new("hr", tier, "u")).await.unwrap());
    }
    let daily = store
        .read_records(&TierKey::new("hr", "1d", "u"), TimeRange::new_unchecked(0, 3 * DAY_MS))
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.value("value", Reducer::Sum))
        .collect();
    (watermarks, daily)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_sliced_refresh_matches_single_refresh(
        samples in samples(300),
        mut cuts in prop::collection::vec(1i64..200, 0..5),
    ) {
        cuts.sort_unstable();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (sliced_marks, sliced) = runtime.block_on(daily_after(&samples, &cuts));
        let (single_marks, single) = runtime.block_on(daily_after(&samples, &[]));

        prop_assert_eq!(sliced.len(), single.len());
        for (a, b) in sliced.iter().zip(single.iter()) {
            prop_assert!(close(*a, *b), "daily sum {} vs {}", a, b);
        }

        // Coarser tiers never run ahead of finer ones
        for marks in [&sliced_marks, &single_marks] {
            let throughs: Vec<Option<i64>> =
                marks.iter().map(|w| w.map(|w| w.materialized_through)).collect();
            for pair in throughs.windows(2) {
                if let (Some(fine), Some(coarse)) = (pair[0], pair[1]) {
                    prop_assert!(coarse <= fine);
                }
            }
        }
        prop_assert_eq!(
            sliced_marks.last().copied().flatten().map(|w| w.materialized_through),
            single_marks.last().copied().flatten().map(|w| w.materialized_through)
        );
    }
}
