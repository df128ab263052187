//! On-disk checkpoint and session archive.
//!
//! Layout inside the sessions directory:
//! - `state.json`: the current [`SessionState`], rewritten after every change
//! - `session-<id>.json`: one immutable record per finished [`Session`]
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader never sees a partial file.

use super::state::{Session, SessionState, SharedSession};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{error, warn};

pub const CHECKPOINT_FILE: &str = "state.json";
const ARCHIVE_PREFIX: &str = "session-";
const ARCHIVE_SUFFIX: &str = ".json";

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("session {id} is already archived")]
    AlreadyArchived { id: String },
}

/// File-backed persistence for session state.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn archive_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{ARCHIVE_PREFIX}{id}{ARCHIVE_SUFFIX}"))
    }

    /// Overwrite the checkpoint with `state`.
    pub fn save_checkpoint(&self, state: &SessionState) -> Result<(), StoreError> {
        let tmp = self.write_temp(&self.checkpoint_path(), state)?;
        let path = self.checkpoint_path();
        tmp.persist(&path).map_err(|e| StoreError::Io {
            path,
            source: e.error,
        })?;
        Ok(())
    }

    /// Checkpoint shared state, logging rather than returning a failure.
    ///
    /// The copy is taken under the lock; the write happens outside it.
    pub fn checkpoint_shared(&self, state: &SharedSession) {
        let snapshot = state.lock().clone();
        if let Err(e) = self.save_checkpoint(&snapshot) {
            error!("Failed to save checkpoint: {}", e);
        }
    }

    /// Load the checkpoint; `Ok(None)` when none has been written yet.
    pub fn load_checkpoint(&self) -> Result<Option<SessionState>, StoreError> {
        let path = self.checkpoint_path();
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let state: SessionState = serde_json::from_slice(&content)
            .map_err(|source| StoreError::Decode { path, source })?;
        Ok(Some(state.normalize()))
    }

    /// Write a finished session to its own file. Existing archives are never replaced.
    pub fn archive(&self, session: &Session) -> Result<PathBuf, StoreError> {
        let path = self.archive_path(&session.id);
        let tmp = self.write_temp(&path, session)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(path),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyArchived {
                    id: session.id.clone(),
                })
            }
            Err(e) => Err(StoreError::Io {
                path,
                source: e.error,
            }),
        }
    }

    /// Load every archived session, oldest first.
    ///
    /// Files that fail to read or decode are logged and skipped.
    pub fn load_archives(&self) -> Result<Vec<Session>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut sessions: Vec<Session> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_archive_name(p))
            .filter_map(|path| match read_archive(&path) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("Skipping archived session: {}", e);
                    None
                }
            })
            .collect();

        sessions.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn write_temp<T: Serialize>(&self, target: &Path, value: &T) -> Result<NamedTempFile, StoreError> {
        let io_err = |source| StoreError::Io {
            path: target.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), value).map_err(|source| {
            StoreError::Encode {
                path: target.to_path_buf(),
                source,
            }
        })?;
        tmp.as_file_mut().flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        Ok(tmp)
    }
}

fn is_archive_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| {
            name != CHECKPOINT_FILE
                && name.starts_with(ARCHIVE_PREFIX)
                && name.ends_with(ARCHIVE_SUFFIX)
        })
}

fn read_archive(path: &Path) -> Result<Session, StoreError> {
    let content = std::fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&content).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::Analysis;
    use chrono::{Duration, TimeZone, Utc};

    fn sample_state() -> SessionState {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap()
            + Duration::nanoseconds(123_456_789);
        let mut state = SessionState::new();
        state.begin("20250301-093000".to_string(), t0);
        for (i, level) in [0.91, 0.2, 0.6037].iter().enumerate() {
            state.record_sample(
                PathBuf::from(format!("/data/images/capture-{i}.jpg")),
                Analysis {
                    is_focused: *level > 0.5,
                    focus_level: *level,
                    is_away: i == 1,
                    summary: format!("sample {i}"),
                },
                41.237 + i as f64,
                t0 + Duration::seconds(60 * i as i64),
            );
        }
        state
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        let state = sample_state();

        store.save_checkpoint(&state).unwrap();
        let loaded = SessionStore::new(dir.path().join("sessions"))
            .load_checkpoint()
            .unwrap()
            .unwrap();

        assert_eq!(loaded, state);
    }

    #[test]
    fn test_checkpoint_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save_checkpoint(&sample_state()).unwrap();
        store.save_checkpoint(&SessionState::new()).unwrap();

        let loaded = store.load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded, SessionState::new());
        // No temp files left behind.
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_missing_checkpoint_is_fresh_install() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("never-created"));
        assert!(store.load_checkpoint().unwrap().is_none());
        assert!(store.load_archives().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(store.checkpoint_path(), b"{not json").unwrap();

        let err = store.load_checkpoint().unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }), "{err}");
    }

    #[test]
    fn test_archives_load_and_skip_junk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let mut later = sample_state();
        let session_b = later.end(Utc.with_ymd_and_hms(2025, 3, 2, 10, 0, 0).unwrap()).unwrap();
        let mut session_a = session_b.clone();
        session_a.id = "20250228-080000".to_string();
        session_a.start = Utc.with_ymd_and_hms(2025, 2, 28, 8, 0, 0).unwrap();

        store.archive(&session_b).unwrap();
        store.archive(&session_a).unwrap();
        store.save_checkpoint(&later).unwrap();
        std::fs::write(dir.path().join("session-broken.json"), b"garbage").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let loaded = store.load_archives().unwrap();
        assert_eq!(loaded, vec![session_a, session_b]);
    }

    #[test]
    fn test_archive_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let session = sample_state().end(Utc::now()).unwrap();

        let path = store.archive(&session).unwrap();
        assert_eq!(path, dir.path().join("session-20250301-093000.json"));

        let err = store.archive(&session).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyArchived { .. }), "{err}");
    }
}
