//! Sample store and window aggregation.
//!
//! The store keeps one [`Sample`] and one [`QueueSnapshot`] per successful
//! poll, pruned to a fixed retention horizon. Window sums walk consecutive
//! sample pairs and add the clamped delta of every pair whose later sample
//! falls inside the window, so an upstream counter reset contributes zero
//! instead of a negative total.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::counters::Counters;
use crate::persist::null_as_default;

/// One minute, in milliseconds.
pub const MINUTE_MS: i64 = 60_000;
/// One hour, in milliseconds.
pub const HOUR_MS: i64 = 60 * MINUTE_MS;

/// Cumulative counters captured at one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sample {
    /// Poll time, epoch milliseconds
    #[serde(deserialize_with = "null_as_default")]
    pub t: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub received: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub delivered: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub deferred: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub bounced: u64,
}

impl Sample {
    #[must_use]
    pub fn from_counters(t: i64, counters: &Counters) -> Self {
        Self {
            t,
            received: counters.received,
            delivered: counters.delivered,
            deferred: counters.deferred,
            bounced: counters.bounced,
        }
    }
}

/// Instantaneous queue gauges captured at one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSnapshot {
    /// Poll time, epoch milliseconds
    #[serde(deserialize_with = "null_as_default")]
    pub t: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub depth: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub ready: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub scheduled: u64,
}

impl QueueSnapshot {
    #[must_use]
    pub fn from_counters(t: i64, counters: &Counters) -> Self {
        Self {
            t,
            depth: counters.queue_depth,
            ready: counters.ready,
            scheduled: counters.scheduled,
        }
    }
}

/// Totals over a trailing window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowStat {
    #[serde(deserialize_with = "null_as_default")]
    pub received: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub delivered: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub deferred: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub bounced: u64,
}

impl WindowStat {
    /// Field-wise maximum.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self {
            received: self.received.max(other.received),
            delivered: self.delivered.max(other.delivered),
            deferred: self.deferred.max(other.deferred),
            bounced: self.bounced.max(other.bounced),
        }
    }

    fn add_pair(&mut self, earlier: &Sample, later: &Sample) {
        self.received = self
            .received
            .saturating_add(later.received.saturating_sub(earlier.received));
        self.delivered = self
            .delivered
            .saturating_add(later.delivered.saturating_sub(earlier.delivered));
        self.deferred = self
            .deferred
            .saturating_add(later.deferred.saturating_sub(earlier.deferred));
        self.bounced = self
            .bounced
            .saturating_add(later.bounced.saturating_sub(earlier.bounced));
    }
}

/// All-time high-water marks per window class. Never decrease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakRecords {
    #[serde(deserialize_with = "null_as_default")]
    pub minute: WindowStat,
    #[serde(deserialize_with = "null_as_default")]
    pub hour: WindowStat,
}

impl PeakRecords {
    /// Raise each peak field to at least the observed value.
    pub fn observe(&mut self, minute: WindowStat, hour: WindowStat) {
        self.minute = self.minute.max(minute);
        self.hour = self.hour.max(hour);
    }
}

/// Sum clamped deltas of every consecutive pair whose later timestamp lies
/// in `(now - window, now]`.
#[must_use]
pub fn window_sum<'a>(
    samples: impl IntoIterator<Item = &'a Sample>,
    now_ms: i64,
    window_ms: i64,
) -> WindowStat {
    let start = now_ms.saturating_sub(window_ms);
    let mut stat = WindowStat::default();
    let mut previous: Option<&Sample> = None;
    for sample in samples {
        if let Some(earlier) = previous {
            if sample.t > start && sample.t <= now_ms {
                stat.add_pair(earlier, sample);
            }
        }
        previous = Some(sample);
    }
    stat
}

/// Append-only, time-pruned history of samples and queue snapshots.
#[derive(Debug, Clone)]
pub struct SampleStore {
    samples: VecDeque<Sample>,
    queue: VecDeque<QueueSnapshot>,
    retention_ms: i64,
}

impl SampleStore {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            queue: VecDeque::new(),
            retention_ms: i64::try_from(retention.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Rebuild a store from persisted history, re-applying retention at `now_ms`.
    #[must_use]
    pub fn restore(
        retention: Duration,
        samples: Vec<Sample>,
        queue: Vec<QueueSnapshot>,
        now_ms: i64,
    ) -> Self {
        let mut store = Self::new(retention);
        store.samples = samples.into();
        store.queue = queue.into();
        store.samples.make_contiguous().sort_by_key(|s| s.t);
        store.queue.make_contiguous().sort_by_key(|q| q.t);
        store.prune(now_ms);
        store
    }

    /// Record one poll and prune expired history.
    pub fn append(&mut self, now_ms: i64, counters: &Counters) {
        self.samples.push_back(Sample::from_counters(now_ms, counters));
        self.queue
            .push_back(QueueSnapshot::from_counters(now_ms, counters));
        self.prune(now_ms);
    }

    /// Drop entries older than the retention horizon. Idempotent.
    pub fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(self.retention_ms);
        while self.samples.front().is_some_and(|s| s.t < cutoff) {
            self.samples.pop_front();
        }
        while self.queue.front().is_some_and(|q| q.t < cutoff) {
            self.queue.pop_front();
        }
    }

    /// Windowed totals ending at `now_ms`. Fewer than two samples yields zero.
    #[must_use]
    pub fn window(&self, now_ms: i64, window_ms: i64) -> WindowStat {
        window_sum(&self.samples, now_ms, window_ms)
    }

    #[must_use]
    pub fn samples(&self) -> &VecDeque<Sample> {
        &self.samples
    }

    #[must_use]
    pub fn queue(&self) -> &VecDeque<QueueSnapshot> {
        &self.queue
    }

    #[must_use]
    pub fn latest_queue(&self) -> Option<&QueueSnapshot> {
        self.queue.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }
}
