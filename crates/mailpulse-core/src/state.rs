//! Owned pipeline state.
//!
//! [`PipelineState`] is the single writer for every in-memory store. The
//! runtime task calls one handler at a time (`on_poll`, `on_line`, ...), so
//! no store is shared or locked.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use crate::classify::{self, Classification};
use crate::config::Config;
use crate::counters::{self, Counters};
use crate::ledger::{
    DeferralEvent, DeferralLog, ErrorLedger, LastError, RecentEvent, RecentEvents,
};
use crate::persist::PersistedState;
use crate::samples::{HOUR_MS, MINUTE_MS, PeakRecords, SampleStore, WindowStat};
use crate::tailer::TailLine;

/// Current wall-clock time, epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Presentation bounds taken from config.
#[derive(Debug, Clone, Copy)]
pub struct ViewLimits {
    pub rate_points: usize,
    pub queue_points: usize,
    pub top_n: usize,
    pub ranking_window: Duration,
    pub max_line_len: usize,
}

impl ViewLimits {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            rate_points: config.metrics.rate_points,
            queue_points: config.metrics.queue_points,
            top_n: config.deferrals.top_n,
            ranking_window: config.deferrals.ranking_window(),
            max_line_len: config.events.max_line_len,
        }
    }
}

/// Poll bookkeeping surfaced in snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollHealth {
    pub last_success: Option<i64>,
    pub consecutive_failures: u64,
    pub total_failures: u64,
}

#[derive(Debug)]
pub struct PipelineState {
    samples: SampleStore,
    peaks: PeakRecords,
    deferrals: DeferralLog,
    errors: ErrorLedger,
    recent: RecentEvents,
    totals: Counters,
    poll: PollHealth,
    limits: ViewLimits,
}

impl PipelineState {
    /// Empty state for a cold start.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            samples: SampleStore::new(config.metrics.retention()),
            peaks: PeakRecords::default(),
            deferrals: DeferralLog::new(config.deferrals.retention(), config.deferrals.max_events),
            errors: ErrorLedger::new(config.errors.per_domain_cap, config.errors.retention()),
            recent: RecentEvents::new(config.events.recent_cap),
            totals: Counters::default(),
            poll: PollHealth::default(),
            limits: ViewLimits::from_config(config),
        }
    }

    /// Rebuild from a snapshot, re-applying every retention rule at `now_ms`.
    #[must_use]
    pub fn restore(config: &Config, persisted: PersistedState, now_ms: i64) -> Self {
        let mut state = Self::new(config);
        state.samples = SampleStore::restore(
            config.metrics.retention(),
            persisted.samples,
            persisted.queue,
            now_ms,
        );
        state.peaks = persisted.peaks;
        state.deferrals = DeferralLog::restore(
            config.deferrals.retention(),
            config.deferrals.max_events,
            persisted.deferrals,
            now_ms,
        );
        if let Some(last) = state.samples.samples().back() {
            state.totals.received = last.received;
            state.totals.delivered = last.delivered;
            state.totals.deferred = last.deferred;
            state.totals.bounced = last.bounced;
        }
        if let Some(queue) = state.samples.latest_queue() {
            state.totals.queue_depth = queue.depth;
            state.totals.ready = queue.ready;
            state.totals.scheduled = queue.scheduled;
        }
        debug!(
            samples = state.samples.len(),
            deferrals = state.deferrals.len(),
            saved_at = persisted.saved_at,
            "Restored persisted state"
        );
        state
    }

    /// Record a successful poll: normalize, append, update peaks.
    pub fn on_poll(&mut self, now_ms: i64, doc: &Value) -> Counters {
        let counters = counters::normalize(doc);
        self.samples.append(now_ms, &counters);
        self.totals = counters;
        self.peaks
            .observe(self.samples.window(now_ms, MINUTE_MS), self.samples.window(now_ms, HOUR_MS));
        self.poll.last_success = Some(now_ms);
        self.poll.consecutive_failures = 0;
        counters
    }

    /// A failed poll leaves every store untouched.
    pub fn on_poll_failed(&mut self) {
        self.poll.consecutive_failures += 1;
        self.poll.total_failures += 1;
    }

    /// Classify one tailed line and feed the ledgers.
    pub fn on_line(&mut self, now_ms: i64, line: &TailLine) -> Classification {
        let classification = classify::classify_line(&line.line, self.limits.max_line_len);

        self.recent.push(RecentEvent {
            t: now_ms,
            source: line.source.clone(),
            level: classification.level,
            msg: classification.message.clone(),
        });

        if let Some(deferral) = &classification.deferral {
            trace!(source = %line.source, domain = %deferral.domain, "Deferral detected");
            self.deferrals.push(
                DeferralEvent {
                    t: now_ms,
                    domain: deferral.domain.clone(),
                },
                now_ms,
            );
            if let Some(detail) = &deferral.detail {
                let provider = detail
                    .provider
                    .clone()
                    .unwrap_or_else(|| classify::classify_provider(&deferral.domain));
                self.errors.push(
                    LastError {
                        ts: now_ms,
                        domain: deferral.domain.clone(),
                        provider: Some(provider),
                        code: detail.code,
                        enhanced_code: detail.enhanced_code.clone(),
                        text: detail.text.clone(),
                    },
                    now_ms,
                );
            }
        }
        classification
    }

    /// Apply time-based pruning without new input.
    pub fn prune(&mut self, now_ms: i64) {
        self.samples.prune(now_ms);
        self.deferrals.prune(now_ms);
    }

    /// The persisted subset of the state.
    #[must_use]
    pub fn to_persisted(&self, now_ms: i64) -> PersistedState {
        PersistedState {
            saved_at: now_ms,
            samples: self.samples.samples().iter().copied().collect(),
            queue: self.samples.queue().iter().copied().collect(),
            peaks: self.peaks,
            deferrals: self.deferrals.events().iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn window(&self, now_ms: i64, window_ms: i64) -> WindowStat {
        self.samples.window(now_ms, window_ms)
    }

    #[must_use]
    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    #[must_use]
    pub fn peaks(&self) -> &PeakRecords {
        &self.peaks
    }

    #[must_use]
    pub fn deferrals(&self) -> &DeferralLog {
        &self.deferrals
    }

    #[must_use]
    pub fn errors(&self) -> &ErrorLedger {
        &self.errors
    }

    #[must_use]
    pub fn recent(&self) -> &RecentEvents {
        &self.recent
    }

    #[must_use]
    pub fn totals(&self) -> &Counters {
        &self.totals
    }

    #[must_use]
    pub fn poll_health(&self) -> PollHealth {
        self.poll
    }

    #[must_use]
    pub fn limits(&self) -> ViewLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(text: &str) -> TailLine {
        TailLine {
            source: "test".to_string(),
            line: text.to_string(),
        }
    }

    #[test]
    fn poll_updates_totals_and_peaks() {
        let mut state = PipelineState::new(&Config::default());
        state.on_poll(0, &json!({"total_messages_delivered": 100}));
        state.on_poll(60_000, &json!({"total_messages_delivered": 160}));
        assert_eq!(state.totals().delivered, 160);
        assert_eq!(state.peaks().minute.delivered, 60);
        assert_eq!(state.poll_health().last_success, Some(60_000));
    }

    #[test]
    fn failed_poll_changes_nothing_but_health() {
        let mut state = PipelineState::new(&Config::default());
        state.on_poll(0, &json!({"total_messages_delivered": 1}));
        state.on_poll_failed();
        state.on_poll_failed();
        assert_eq!(state.samples().len(), 1);
        assert_eq!(state.poll_health().consecutive_failures, 2);
    }

    #[test]
    fn json_deferral_feeds_both_ledgers() {
        let mut state = PipelineState::new(&Config::default());
        state.on_line(
            1_000,
            &line(r#"{"event":"TransientFailure","domain":"example.com","response":{"code":450,"text":"try again"}}"#),
        );
        assert_eq!(state.deferrals().len(), 1);
        assert_eq!(state.deferrals().events()[0].domain, "example.com");
        let errors = state.errors().for_domain("example.com").unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, Some(450));
        assert_eq!(errors[0].text, "try again");
        assert_eq!(errors[0].provider.as_deref(), Some("example.com"));
        assert_eq!(state.recent().len(), 1);
    }

    #[test]
    fn plain_line_only_reaches_recent_events() {
        let mut state = PipelineState::new(&Config::default());
        state.on_line(1, &line("worker started"));
        assert!(state.deferrals().is_empty());
        assert_eq!(state.errors().domain_count(), 0);
        assert_eq!(state.recent().len(), 1);
    }

    #[test]
    fn restore_reprunes_and_keeps_peaks() {
        let config = Config::default();
        let mut state = PipelineState::new(&config);
        state.on_poll(0, &json!({"total_messages_delivered": 0}));
        state.on_poll(60_000, &json!({"total_messages_delivered": 500}));
        state.on_line(60_000, &line("rcpt=<a@b.example> 451 try again"));
        let persisted = state.to_persisted(60_000);

        let far_future = 60_000 + 3 * 24 * HOUR_MS;
        let restored = PipelineState::restore(&config, persisted, far_future);
        assert!(restored.samples().is_empty());
        assert!(restored.deferrals().is_empty());
        assert_eq!(restored.peaks().minute.delivered, 500);
    }
}
