//! Durable pipeline state.
//!
//! One JSON document holds samples, queue snapshots, peaks and deferral
//! events. Writes go to a sibling temp file that is renamed over the target,
//! so a crash mid-write leaves the previous snapshot intact. Loading is
//! lenient: missing fields default, and an unreadable file is a cold start.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::PersistError;
use crate::ledger::DeferralEvent;
use crate::samples::{PeakRecords, QueueSnapshot, Sample};

/// Reads an explicit `null` the same as a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    /// Epoch milliseconds of the save
    #[serde(deserialize_with = "null_as_default")]
    pub saved_at: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub samples: Vec<Sample>,
    #[serde(alias = "queueSnapshots", deserialize_with = "null_as_default")]
    pub queue: Vec<QueueSnapshot>,
    #[serde(deserialize_with = "null_as_default")]
    pub peaks: PeakRecords,
    #[serde(alias = "events", deserialize_with = "null_as_default")]
    pub deferrals: Vec<DeferralEvent>,
}

/// Location of the state document on disk.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last snapshot. Missing or malformed files yield `None`.
    #[must_use]
    pub fn load(&self) -> Option<PersistedState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file; cold start");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "State file unreadable; cold start");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "State file malformed; cold start");
                None
            }
        }
    }

    /// Atomically replace the state document, creating parent directories.
    pub fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let write_failed = |path: &Path, e: std::io::Error| PersistError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
            }
        }

        let content =
            serde_json::to_vec(state).map_err(|e| PersistError::EncodeFailed(e.to_string()))?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(|e| write_failed(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| write_failed(&self.path, e))?;

        debug!(
            path = %self.path.display(),
            samples = state.samples.len(),
            deferrals = state.deferrals.len(),
            "Saved state"
        );
        Ok(())
    }

    /// [`Self::save`] on the blocking pool.
    pub async fn save_async(&self, state: PersistedState) -> Result<(), PersistError> {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.save(&state))
            .await
            .map_err(|e| PersistError::WriteFailed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::WindowStat;

    fn sample_state() -> PersistedState {
        PersistedState {
            saved_at: 42,
            samples: vec![Sample {
                t: 1,
                delivered: 5,
                ..Sample::default()
            }],
            queue: vec![QueueSnapshot {
                t: 1,
                depth: 3,
                ..QueueSnapshot::default()
            }],
            peaks: PeakRecords::default(),
            deferrals: vec![DeferralEvent {
                t: 1,
                domain: "example.com".to_string(),
            }],
        }
    }

    #[test]
    fn save_then_load_returns_same_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("nested/state.json"));
        file.save(&sample_state()).unwrap();
        assert_eq!(file.load(), Some(sample_state()));
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StateFile::new(dir.path().join("absent.json")).load().is_none());
    }

    #[test]
    fn malformed_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(StateFile::new(path).load().is_none());
    }

    #[test]
    fn missing_fields_are_default_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"samples":[{"t":5,"delivered":2}],"events":[]}"#).unwrap();
        let state = StateFile::new(path).load().unwrap();
        assert_eq!(state.samples[0].received, 0);
        assert_eq!(state.samples[0].delivered, 2);
        assert!(state.queue.is_empty());
        assert_eq!(state.peaks, PeakRecords::default());
    }

    #[test]
    fn legacy_event_without_domain_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"savedAt":1,"peaks":{"minute":{"delivered":500}},"deferrals":[{"t":5}]}"#,
        )
        .unwrap();
        let state = StateFile::new(path).load().unwrap();
        assert_eq!(state.peaks.minute.delivered, 500);
        assert_eq!(state.deferrals, vec![DeferralEvent { t: 5, domain: String::new() }]);
    }

    #[test]
    fn null_peaks_and_fields_read_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"peaks":{"minute":{"delivered":500,"bounced":null},"hour":null},"samples":null}"#,
        )
        .unwrap();
        let state = StateFile::new(path).load().unwrap();
        assert_eq!(state.peaks.minute.delivered, 500);
        assert_eq!(state.peaks.minute.bounced, 0);
        assert_eq!(state.peaks.hour, WindowStat::default());
        assert!(state.samples.is_empty());
    }

    #[test]
    fn write_into_file_path_parent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let err = StateFile::new(blocker.join("state.json"))
            .save(&PersistedState::default())
            .unwrap_err();
        assert!(matches!(err, PersistError::WriteFailed { .. }));
    }

    #[tokio::test]
    async fn async_save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));
        file.save_async(sample_state()).await.unwrap();
        assert_eq!(file.load().unwrap().saved_at, 42);
    }
}
