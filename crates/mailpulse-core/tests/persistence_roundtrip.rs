//! Persistence round trips through a real state file.
//!
//! Restore re-applies retention, so saving, restoring and saving again can
//! only ever shrink history.

use mailpulse_core::config::Config;
use mailpulse_core::persist::{PersistedState, StateFile};
use mailpulse_core::samples::HOUR_MS;
use mailpulse_core::state::PipelineState;
use mailpulse_core::tailer::TailLine;
use serde_json::json;

fn deferral_line(domain: &str) -> TailLine {
    TailLine {
        source: "files".to_string(),
        line: format!("rcpt=<x@{domain}> 451 4.7.1 try again later"),
    }
}

fn populated_state(config: &Config, start: i64) -> PipelineState {
    let mut state = PipelineState::new(config);
    for i in 0..20 {
        let t = start + i * 60_000;
        state.on_poll(t, &json!({"total_messages_delivered": i * 100, "ready_count": i}));
        state.on_line(t, &deferral_line(if i % 2 == 0 { "a.example" } else { "b.example" }));
    }
    state
}

fn is_subset(inner: &PersistedState, outer: &PersistedState) -> bool {
    inner.samples.iter().all(|s| outer.samples.contains(s))
        && inner.queue.iter().all(|q| outer.queue.contains(q))
        && inner.deferrals.iter().all(|d| outer.deferrals.contains(d))
}

#[test]
fn restore_then_resave_is_identical_when_nothing_expired() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let file = StateFile::new(dir.path().join("state.json"));

    let state = populated_state(&config, 0);
    let now = 19 * 60_000;
    let original = state.to_persisted(now);
    file.save(&original).unwrap();

    let restored = PipelineState::restore(&config, file.load().unwrap(), now);
    let resaved = restored.to_persisted(now);
    assert_eq!(resaved.samples, original.samples);
    assert_eq!(resaved.deferrals, original.deferrals);
    assert_eq!(resaved.peaks, original.peaks);
}

#[test]
fn restore_after_downtime_is_a_subset() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let file = StateFile::new(dir.path().join("state.json"));

    let original = populated_state(&config, 0).to_persisted(19 * 60_000);
    file.save(&original).unwrap();

    // Sample retention is two hours; jump so roughly half expire.
    let later = 19 * 60_000 + 2 * HOUR_MS - 10 * 60_000;
    let restored = PipelineState::restore(&config, file.load().unwrap(), later);
    let resaved = restored.to_persisted(later);

    assert!(is_subset(&resaved, &original));
    assert!(resaved.samples.len() < original.samples.len());
    assert!(!resaved.samples.is_empty());
    assert_eq!(resaved.deferrals.len(), original.deferrals.len());
    assert_eq!(resaved.peaks, original.peaks);
}

#[test]
fn peaks_survive_restart_and_keep_rising() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let file = StateFile::new(dir.path().join("state.json"));

    let first = populated_state(&config, 0);
    let peak_before = first.peaks().minute.delivered;
    assert_eq!(peak_before, 100);
    file.save(&first.to_persisted(19 * 60_000)).unwrap();

    let now = 20 * 60_000;
    let mut second = PipelineState::restore(&config, file.load().unwrap(), now);
    // A quiet minute must not lower the recorded peak.
    second.on_poll(now, &json!({"total_messages_delivered": 1900}));
    assert_eq!(second.peaks().minute.delivered, peak_before);

    second.on_poll(now + 60_000, &json!({"total_messages_delivered": 2500}));
    assert_eq!(second.peaks().minute.delivered, 600);
}

#[test]
fn corrupt_state_file_means_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, b"\x00\x01 definitely not json").unwrap();
    let file = StateFile::new(&path);
    assert!(file.load().is_none());

    // The next save replaces the corrupt file.
    file.save(&PersistedState::default()).unwrap();
    assert_eq!(file.load(), Some(PersistedState::default()));
}
