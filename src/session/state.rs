//! In-memory session state and the views derived from it.

use crate::inference::Analysis;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// One timestamped sample in a session's time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusPoint {
    pub timestamp: DateTime<Utc>,
    pub decibels: f64,
    pub focus_level: f64,
    pub is_focused: bool,
    pub is_away: bool,
}

impl FocusPoint {
    pub fn new(timestamp: DateTime<Utc>, decibels: f64, analysis: &Analysis) -> Self {
        Self {
            timestamp,
            decibels,
            focus_level: analysis.focus_level,
            is_focused: analysis.is_focused,
            is_away: analysis.is_away,
        }
    }
}

/// A finished session, archived when it stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub samples_count: usize,
    pub focus_history: Vec<FocusPoint>,
    pub last_analysis: Analysis,
}

/// Listing entry for an archived session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub samples_count: usize,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            start: session.start,
            end: session.end,
            samples_count: session.samples_count,
        }
    }
}

/// Dashboard view of the current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyStats {
    pub status: String,
    pub timestamp: String,
    pub session_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_started: Option<String>,
    pub duration_seconds: i64,
    pub samples_count: usize,
    pub last_image_url: String,
    pub last_analysis: Analysis,
    pub focus_history: Vec<FocusPoint>,
}

/// The single record of session status and accumulated samples.
///
/// Fields are private so `samples_count` can only move together with
/// `focus_history`; the checkpoint format is this struct serialized as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    active: bool,
    started_at: Option<DateTime<Utc>>,
    session_id: Option<String>,
    samples_count: usize,
    last_artifact_path: Option<PathBuf>,
    last_analysis: Analysis,
    focus_history: Vec<FocusPoint>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn samples_count(&self) -> usize {
        self.samples_count
    }

    pub fn last_artifact_path(&self) -> Option<&PathBuf> {
        self.last_artifact_path.as_ref()
    }

    pub fn last_analysis(&self) -> &Analysis {
        &self.last_analysis
    }

    pub fn focus_history(&self) -> &[FocusPoint] {
        &self.focus_history
    }

    /// Start a new session, discarding the previous session's samples.
    pub fn begin(&mut self, id: String, now: DateTime<Utc>) {
        self.active = true;
        self.started_at = Some(now);
        self.session_id = Some(id);
        self.samples_count = 0;
        self.focus_history.clear();
    }

    /// Stop the session. Returns the archived copy if one was running.
    ///
    /// `started_at` is kept so the dashboard can still show when the last
    /// session began.
    pub fn end(&mut self, now: DateTime<Utc>) -> Option<Session> {
        let was_active = std::mem::replace(&mut self.active, false);
        let id = self.session_id.take();
        if !was_active {
            return None;
        }
        Some(Session {
            id: id.unwrap_or_else(|| session_id_at(now)),
            start: self.started_at.unwrap_or(now),
            end: now,
            samples_count: self.samples_count,
            focus_history: self.focus_history.clone(),
            last_analysis: self.last_analysis.clone(),
        })
    }

    /// Merge one completed capture cycle.
    pub fn record_sample(
        &mut self,
        artifact: PathBuf,
        analysis: Analysis,
        decibels: f64,
        at: DateTime<Utc>,
    ) {
        self.focus_history
            .push(FocusPoint::new(at, decibels, &analysis));
        self.samples_count = self.focus_history.len();
        self.last_artifact_path = Some(artifact);
        self.last_analysis = analysis;
    }

    /// Build the dashboard view at `now`.
    pub fn stats(&self, now: DateTime<Utc>, last_image_url: Option<String>) -> StudyStats {
        let duration_seconds = match (self.active, self.started_at) {
            (true, Some(start)) => (now - start).num_seconds().max(0),
            _ => 0,
        };
        StudyStats {
            status: if self.active { "studying" } else { "idle" }.to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            session_active: self.active,
            session_started: self
                .started_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            duration_seconds,
            samples_count: self.samples_count,
            last_image_url: last_image_url.unwrap_or_default(),
            last_analysis: self.last_analysis.clone(),
            focus_history: self.focus_history.clone(),
        }
    }

    /// Restore the `samples_count == focus_history.len()` invariant after
    /// loading a checkpoint written by something else.
    pub(crate) fn normalize(mut self) -> Self {
        self.samples_count = self.focus_history.len();
        if self.active && self.started_at.is_none() {
            self.active = false;
            self.session_id = None;
        }
        self
    }
}

/// Session state shared between the scheduler and request handlers.
///
/// The lock is only held for in-memory updates, never across a capture or
/// network call.
pub type SharedSession = Arc<Mutex<SessionState>>;

/// Create new shared session state.
pub fn create_shared_session(state: SessionState) -> SharedSession {
    Arc::new(Mutex::new(state))
}

/// Session id for a start time, e.g. `20250301-143005` (local time).
pub fn session_id_at(now: DateTime<Utc>) -> String {
    now.with_timezone(&Local).format("%Y%m%d-%H%M%S").to_string()
}

/// Make `base` unique by appending `-2`, `-3`, ... while `is_taken` says so.
pub fn unique_session_id(base: String, is_taken: impl Fn(&str) -> bool) -> String {
    if !is_taken(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
