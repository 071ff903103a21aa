//! Property-based tests for the sample store and window aggregation.
//!
//! Verifies:
//! - Window sums never exceed the positive deltas available in the window
//! - Monotone counters: a window covering every pair equals last - first
//! - Peak records never decrease, field-wise
//! - Prune is idempotent and leaves nothing older than retention
//! - Restore never yields more history than it was given
//! - Rate series is finite and non-negative

use std::time::Duration;

use proptest::prelude::*;

use mailpulse_core::counters::Counters;
use mailpulse_core::rates::rate_series;
use mailpulse_core::samples::{
    HOUR_MS, MINUTE_MS, PeakRecords, Sample, SampleStore, WindowStat, window_sum,
};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

/// (elapsed ms, delivered increment, counter reset)
fn arb_steps(max_len: usize) -> impl Strategy<Value = Vec<(i64, u64, bool)>> {
    prop::collection::vec((0i64..20_000, 0u64..500, prop::bool::weighted(0.1)), 1..max_len)
}

fn build_samples(steps: &[(i64, u64, bool)]) -> Vec<Sample> {
    let mut t = 0;
    let mut delivered = 0u64;
    steps
        .iter()
        .map(|&(dt, inc, reset)| {
            t += dt;
            delivered = if reset { inc } else { delivered + inc };
            Sample {
                t,
                delivered,
                received: delivered / 2,
                ..Sample::default()
            }
        })
        .collect()
}

fn positive_delta_total(samples: &[Sample]) -> u64 {
    samples
        .windows(2)
        .map(|pair| pair[1].delivered.saturating_sub(pair[0].delivered))
        .sum()
}

fn arb_stat() -> impl Strategy<Value = WindowStat> {
    (0u64..10_000, 0u64..10_000, 0u64..10_000, 0u64..10_000).prop_map(
        |(received, delivered, deferred, bounced)| WindowStat {
            received,
            delivered,
            deferred,
            bounced,
        },
    )
}

// ────────────────────────────────────────────────────────────────────
// Window sums
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// No window can count more than the clamped deltas that exist.
    #[test]
    fn prop_window_bounded_by_positive_deltas(
        steps in arb_steps(60),
        window in 1i64..(2 * HOUR_MS),
    ) {
        let samples = build_samples(&steps);
        let now = samples.last().map_or(0, |s| s.t);
        let stat = window_sum(&samples, now, window);
        prop_assert!(stat.delivered <= positive_delta_total(&samples));
    }

    /// Without resets, a window spanning every pair is the plain difference.
    #[test]
    fn prop_monotone_full_window_is_last_minus_first(
        increments in prop::collection::vec((1i64..5_000, 0u64..1_000), 2..40),
    ) {
        let steps: Vec<_> = increments.iter().map(|&(dt, inc)| (dt, inc, false)).collect();
        let samples = build_samples(&steps);
        let first = samples[0];
        let last = *samples.last().unwrap();
        let span = last.t - first.t + 1;
        let stat = window_sum(&samples, last.t, span);
        prop_assert_eq!(stat.delivered, last.delivered - first.delivered);
    }

    /// A longer window never reports less than a shorter one.
    #[test]
    fn prop_hour_at_least_minute(steps in arb_steps(60)) {
        let samples = build_samples(&steps);
        let now = samples.last().map_or(0, |s| s.t);
        let minute = window_sum(&samples, now, MINUTE_MS);
        let hour = window_sum(&samples, now, HOUR_MS);
        prop_assert!(hour.delivered >= minute.delivered);
        prop_assert!(hour.received >= minute.received);
    }
}

// ────────────────────────────────────────────────────────────────────
// Peaks
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_peaks_never_decrease(
        observations in prop::collection::vec((arb_stat(), arb_stat()), 1..30),
    ) {
        let mut peaks = PeakRecords::default();
        for (minute, hour) in observations {
            let before = peaks;
            peaks.observe(minute, hour);
            prop_assert!(peaks.minute.delivered >= before.minute.delivered);
            prop_assert!(peaks.minute.deferred >= before.minute.deferred);
            prop_assert!(peaks.hour.received >= before.hour.received);
            prop_assert!(peaks.hour.bounced >= before.hour.bounced);
            prop_assert!(peaks.minute.delivered >= minute.delivered);
            prop_assert!(peaks.hour.deferred >= hour.deferred);
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// Retention
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_prune_is_idempotent(
        times in prop::collection::vec(0i64..1_000_000, 1..50),
        retention_secs in 1u64..600,
        extra in 0i64..1_000_000,
    ) {
        let mut sorted = times;
        sorted.sort_unstable();
        let mut store = SampleStore::new(Duration::from_secs(retention_secs));
        for &t in &sorted {
            store.append(t, &Counters::default());
        }
        let now = sorted.last().copied().unwrap_or(0) + extra;
        store.prune(now);
        let once: Vec<_> = store.samples().iter().copied().collect();
        store.prune(now);
        let twice: Vec<_> = store.samples().iter().copied().collect();
        prop_assert_eq!(&once, &twice);

        let cutoff = now - store.retention_ms();
        prop_assert!(once.iter().all(|s| s.t >= cutoff));
        prop_assert_eq!(store.queue().len(), once.len());
    }

    /// Restoring can only shrink history.
    #[test]
    fn prop_restore_is_subset(
        times in prop::collection::vec(0i64..1_000_000, 0..50),
        now in 0i64..2_000_000,
    ) {
        let samples: Vec<Sample> = times
            .iter()
            .map(|&t| Sample { t, ..Sample::default() })
            .collect();
        let store =
            SampleStore::restore(Duration::from_secs(300), samples.clone(), Vec::new(), now);
        prop_assert!(store.len() <= samples.len());
        for kept in store.samples() {
            prop_assert!(samples.contains(kept));
        }
        let ordered = store
            .samples()
            .iter()
            .zip(store.samples().iter().skip(1))
            .all(|(a, b)| a.t <= b.t);
        prop_assert!(ordered);
    }
}

// ────────────────────────────────────────────────────────────────────
// Rates
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_rates_finite_and_non_negative(steps in arb_steps(40), limit in 1usize..50) {
        let samples = build_samples(&steps);
        let points: Vec<_> = rate_series(&samples, limit).collect();
        prop_assert!(points.len() <= limit);
        prop_assert_eq!(points.len(), samples.len().saturating_sub(1).min(limit));
        for point in points {
            prop_assert!(point.delivered.is_finite() && point.delivered >= 0.0);
            prop_assert!(point.received.is_finite() && point.received >= 0.0);
        }
    }
}
