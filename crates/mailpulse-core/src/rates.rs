//! Per-minute rate series for charting.
//!
//! Rates are recomputed from the retained samples on every request. The
//! series is lazy and bounded to the most recent `limit` intervals, so the
//! cost is linear in retained samples.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::samples::{QueueSnapshot, Sample};

/// Implied per-minute rates over one sample interval, stamped at its end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatePoint {
    pub t: i64,
    /// `HH:MM:SS` UTC
    pub label: String,
    pub received: f64,
    pub delivered: f64,
    pub deferred: f64,
    pub bounced: f64,
}

/// `max(0, later - earlier)` scaled to a minute. Elapsed time is floored at 1ms.
#[must_use]
pub fn per_minute(earlier: u64, later: u64, elapsed_ms: i64) -> f64 {
    let elapsed = elapsed_ms.max(1) as f64;
    later.saturating_sub(earlier) as f64 * (60_000.0 / elapsed)
}

#[must_use]
pub fn rate_between(earlier: &Sample, later: &Sample) -> RatePoint {
    let elapsed = later.t - earlier.t;
    RatePoint {
        t: later.t,
        label: time_label(later.t),
        received: per_minute(earlier.received, later.received, elapsed),
        delivered: per_minute(earlier.delivered, later.delivered, elapsed),
        deferred: per_minute(earlier.deferred, later.deferred, elapsed),
        bounced: per_minute(earlier.bounced, later.bounced, elapsed),
    }
}

/// The most recent `limit` rate points, oldest first.
pub fn rate_series<'a, I>(samples: I, limit: usize) -> impl Iterator<Item = RatePoint> + 'a
where
    I: IntoIterator<Item = &'a Sample>,
    I::IntoIter: ExactSizeIterator + Clone + 'a,
{
    let iter = samples.into_iter();
    let pairs = iter.len().saturating_sub(1);
    let skip = pairs.saturating_sub(limit);
    iter.clone()
        .zip(iter.skip(1))
        .skip(skip)
        .map(|(earlier, later)| rate_between(earlier, later))
}

/// The most recent `limit` queue snapshots, oldest first.
pub fn queue_series<'a, I>(queue: I, limit: usize) -> impl Iterator<Item = &'a QueueSnapshot>
where
    I: IntoIterator<Item = &'a QueueSnapshot>,
    I::IntoIter: ExactSizeIterator,
{
    let iter = queue.into_iter();
    let skip = iter.len().saturating_sub(limit);
    iter.skip(skip)
}

/// Format an epoch-millisecond timestamp as `HH:MM:SS` UTC.
#[must_use]
pub fn time_label(t_ms: i64) -> String {
    DateTime::from_timestamp_millis(t_ms)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}
