//! Event and error ledgers.
//!
//! - [`DeferralLog`]: time-ordered deferral events, pruned by age on every
//!   insert and batch-evicted down to 90% of the cap when it overflows.
//! - [`ErrorLedger`]: per-domain FIFO of recent failure reasons with a
//!   cross-domain age sweep on every insert.
//! - [`RecentEvents`]: flat most-recent-N display lines.
//!
//! Only the deferral log is persisted; the other two are rebuilt live.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persist::null_as_default;
use crate::ring_buffer::RingBuffer;

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// One detected transient failure for a destination domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferralEvent {
    /// Detection time, epoch milliseconds
    #[serde(deserialize_with = "null_as_default")]
    pub t: i64,
    /// Lower-cased destination domain
    #[serde(deserialize_with = "null_as_default")]
    pub domain: String,
}

/// Ranked count for a domain or provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub name: String,
    pub count: u64,
}

/// Bounded, time-decayed sequence of deferral events.
#[derive(Debug, Clone)]
pub struct DeferralLog {
    events: VecDeque<DeferralEvent>,
    retention_ms: i64,
    max_events: usize,
}

impl DeferralLog {
    #[must_use]
    pub fn new(retention: Duration, max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            retention_ms: duration_ms(retention),
            max_events: max_events.max(1),
        }
    }

    /// Rebuild from persisted events, re-applying both retention rules.
    /// Events without a domain are dropped.
    #[must_use]
    pub fn restore(
        retention: Duration,
        max_events: usize,
        mut events: Vec<DeferralEvent>,
        now_ms: i64,
    ) -> Self {
        events.retain(|event| !event.domain.trim().is_empty());
        events.sort_by_key(|event| event.t);
        let mut log = Self::new(retention, max_events);
        log.events = events.into();
        log.prune(now_ms);
        log
    }

    pub fn push(&mut self, event: DeferralEvent, now_ms: i64) {
        self.events.push_back(event);
        self.prune(now_ms);
    }

    /// Drop expired events, then batch-evict the oldest when over the cap.
    pub fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(self.retention_ms);
        while self.events.front().is_some_and(|event| event.t < cutoff) {
            self.events.pop_front();
        }
        if self.events.len() > self.max_events {
            let keep = (self.max_events * 9 / 10).max(1);
            let excess = self.events.len() - keep;
            self.events.drain(..excess);
        }
    }

    /// Counts per key over events newer than `now_ms - window`, sorted by
    /// count descending then name, truncated to `limit`.
    #[must_use]
    pub fn ranked_by<F>(
        &self,
        now_ms: i64,
        window: Duration,
        limit: usize,
        key: F,
    ) -> Vec<RankedEntry>
    where
        F: Fn(&str) -> String,
    {
        let since = now_ms.saturating_sub(duration_ms(window));
        let mut counts: HashMap<String, u64> = HashMap::new();
        for event in self.events.iter().rev().take_while(|event| event.t >= since) {
            *counts.entry(key(&event.domain)).or_default() += 1;
        }
        let mut ranked: Vec<RankedEntry> = counts
            .into_iter()
            .map(|(name, count)| RankedEntry { name, count })
            .collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        ranked.truncate(limit);
        ranked
    }

    #[must_use]
    pub fn events(&self) -> &VecDeque<DeferralEvent> {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// One recent failure reason for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Epoch milliseconds
    pub ts: i64,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_code: Option<String>,
    pub text: String,
}

/// Per-domain bounded history of failure reasons.
#[derive(Debug, Clone)]
pub struct ErrorLedger {
    by_domain: HashMap<String, VecDeque<LastError>>,
    per_domain_cap: usize,
    retention_ms: i64,
}

impl ErrorLedger {
    #[must_use]
    pub fn new(per_domain_cap: usize, retention: Duration) -> Self {
        Self {
            by_domain: HashMap::new(),
            per_domain_cap: per_domain_cap.max(1),
            retention_ms: duration_ms(retention),
        }
    }

    /// Insert, evict the domain's oldest on overflow, then sweep every domain
    /// for records past retention.
    pub fn push(&mut self, record: LastError, now_ms: i64) {
        let entries = self.by_domain.entry(record.domain.clone()).or_default();
        entries.push_back(record);
        while entries.len() > self.per_domain_cap {
            entries.pop_front();
        }

        let cutoff = now_ms.saturating_sub(self.retention_ms);
        self.by_domain.retain(|_, entries| {
            entries.retain(|entry| entry.ts >= cutoff);
            !entries.is_empty()
        });
    }

    /// Records for one domain, oldest first.
    #[must_use]
    pub fn for_domain(&self, domain: &str) -> Option<&VecDeque<LastError>> {
        self.by_domain.get(domain)
    }

    /// Every domain's records, newest first, in domain order.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<LastError>> {
        self.by_domain
            .iter()
            .map(|(domain, entries)| (domain.clone(), entries.iter().rev().cloned().collect()))
            .collect()
    }

    #[must_use]
    pub fn domain_count(&self) -> usize {
        self.by_domain.len()
    }
}

/// Display severity inferred from a level token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl EventLevel {
    fn rank(self) -> u8 {
        match self {
            Self::Debug => 0,
            Self::Info => 1,
            Self::Warn => 2,
            Self::Error => 3,
        }
    }

    /// The more severe of two levels.
    #[must_use]
    pub fn max_severity(self, other: Self) -> Self {
        if other.rank() > self.rank() { other } else { self }
    }
}

/// One human-readable line for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEvent {
    pub t: i64,
    /// Tail source the line came from
    pub source: String,
    pub level: EventLevel,
    pub msg: String,
}

/// Globally bounded most-recent-N display lines.
#[derive(Debug)]
pub struct RecentEvents {
    ring: RingBuffer<RecentEvent>,
}

impl RecentEvents {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
        }
    }

    pub fn push(&mut self, event: RecentEvent) {
        self.ring.push(event);
    }

    /// Up to `limit` events, newest first.
    #[must_use]
    pub fn newest(&self, limit: usize) -> Vec<RecentEvent> {
        self.ring.newest(limit).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}
