//! Read model for consumers.
//!
//! A [`DashboardSnapshot`] is a self-contained, serializable view of the
//! pipeline at one instant. The runtime publishes one after every poll tick
//! and persistence cycle; readers never touch the live stores.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::classify::classify_provider;
use crate::counters::Counters;
use crate::ledger::{LastError, RankedEntry, RecentEvent};
use crate::rates::{self, RatePoint};
use crate::samples::{HOUR_MS, MINUTE_MS, PeakRecords, QueueSnapshot, WindowStat};
use crate::state::PipelineState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueGauges {
    pub depth: u64,
    pub ready: u64,
    pub scheduled: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCounts {
    pub samples: usize,
    pub queue_snapshots: usize,
    pub deferrals: usize,
    pub error_domains: usize,
    pub recent_events: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStatus {
    pub last_success: Option<i64>,
    pub consecutive_failures: u64,
    pub total_failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub generated_at: i64,
    pub totals: Counters,
    pub queue: QueueGauges,
    pub last_minute: WindowStat,
    pub last_hour: WindowStat,
    pub peaks: PeakRecords,
    pub rates: Vec<RatePoint>,
    pub queue_series: Vec<QueueSnapshot>,
    pub top_domains: Vec<RankedEntry>,
    pub top_providers: Vec<RankedEntry>,
    pub recent_events: Vec<RecentEvent>,
    pub last_errors: BTreeMap<String, Vec<LastError>>,
    pub poll: PollStatus,
    pub counts: StoreCounts,
}

impl DashboardSnapshot {
    /// Assemble a view of `state` as of `now_ms`.
    #[must_use]
    pub fn build(state: &PipelineState, now_ms: i64) -> Self {
        let limits = state.limits();
        let store = state.samples();
        let totals = *state.totals();
        let poll = state.poll_health();

        Self {
            generated_at: now_ms,
            totals,
            queue: QueueGauges {
                depth: totals.queue_depth,
                ready: totals.ready,
                scheduled: totals.scheduled,
            },
            last_minute: state.window(now_ms, MINUTE_MS),
            last_hour: state.window(now_ms, HOUR_MS),
            peaks: *state.peaks(),
            rates: rates::rate_series(store.samples(), limits.rate_points).collect(),
            queue_series: rates::queue_series(store.queue(), limits.queue_points)
                .copied()
                .collect(),
            top_domains: state.deferrals().ranked_by(
                now_ms,
                limits.ranking_window,
                limits.top_n,
                str::to_string,
            ),
            top_providers: state.deferrals().ranked_by(
                now_ms,
                limits.ranking_window,
                limits.top_n,
                classify_provider,
            ),
            recent_events: state.recent().newest(state.recent().capacity()),
            last_errors: state.errors().snapshot(),
            poll: PollStatus {
                last_success: poll.last_success,
                consecutive_failures: poll.consecutive_failures,
                total_failures: poll.total_failures,
            },
            counts: StoreCounts {
                samples: store.len(),
                queue_snapshots: store.queue().len(),
                deferrals: state.deferrals().len(),
                error_domains: state.errors().domain_count(),
                recent_events: state.recent().len(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tailer::TailLine;
    use serde_json::json;

    fn deferral_line(domain: &str) -> TailLine {
        TailLine {
            source: "files".to_string(),
            line: format!("rcpt=<u@{domain}> 421 4.7.0 try again later"),
        }
    }

    #[test]
    fn empty_state_is_all_zero() {
        let state = PipelineState::new(&Config::default());
        let snapshot = DashboardSnapshot::build(&state, 1_000);
        assert_eq!(snapshot.generated_at, 1_000);
        assert_eq!(snapshot.totals, Counters::default());
        assert!(snapshot.rates.is_empty());
        assert!(snapshot.top_domains.is_empty());
        assert_eq!(snapshot.counts, StoreCounts::default());
    }

    #[test]
    fn rankings_group_domains_by_provider() {
        let mut state = PipelineState::new(&Config::default());
        for domain in ["gmail.com", "googlemail.com", "gmail.com", "corp.example"] {
            state.on_line(10_000, &deferral_line(domain));
        }
        let snapshot = DashboardSnapshot::build(&state, 10_000);
        assert_eq!(snapshot.top_domains[0].name, "gmail.com");
        assert_eq!(snapshot.top_domains[0].count, 2);
        assert_eq!(snapshot.top_providers[0].name, "google");
        assert_eq!(snapshot.top_providers[0].count, 3);
        assert_eq!(snapshot.last_errors["gmail.com"].len(), 2);
        assert_eq!(snapshot.last_errors["gmail.com"][0].provider.as_deref(), Some("google"));
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let mut state = PipelineState::new(&Config::default());
        state.on_poll(0, &json!({"ready_count": 2, "scheduled_count": 3}));
        let value = serde_json::to_value(DashboardSnapshot::build(&state, 0)).unwrap();
        assert_eq!(value["queue"]["depth"], 5);
        assert!(value.get("lastMinute").is_some());
        assert!(value.get("topProviders").is_some());
        assert_eq!(value["counts"]["queueSnapshots"], 1);
    }

    #[test]
    fn recent_events_are_newest_first() {
        let mut state = PipelineState::new(&Config::default());
        for i in 0..3 {
            state.on_line(
                i,
                &TailLine {
                    source: "files".to_string(),
                    line: format!("line {i}"),
                },
            );
        }
        let snapshot = DashboardSnapshot::build(&state, 3);
        assert_eq!(snapshot.recent_events[0].msg, "line 2");
        assert_eq!(snapshot.recent_events[0].source, "files");
        assert_eq!(snapshot.recent_events.len(), 3);
    }
}
