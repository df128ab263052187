//! The monitor core: owns session state, the capture cycle and the scheduler,
//! and exposes the operations the HTTP layer calls.

use super::state::{
    create_shared_session, session_id_at, unique_session_id, Session, SessionState,
    SessionSummary, SharedSession, StudyStats,
};
use super::store::SessionStore;
use crate::capture::{CaptureCycle, CaptureProgram, CycleError};
use crate::config::{Config, Paths};
use crate::inference::{Analysis, Analyzer};
use crate::scheduler::{Scheduler, SchedulerState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Public URL of the rolling latest image.
pub const LATEST_IMAGE_URL: &str = "/images/latest.jpg";

pub struct FocusMonitor {
    paths: Paths,
    state: SharedSession,
    store: SessionStore,
    /// Archived sessions, oldest first. Also serializes start/stop.
    archive: Mutex<Vec<Session>>,
    cycle: Arc<CaptureCycle>,
    scheduler: Scheduler,
}

impl FocusMonitor {
    /// Build a monitor from configuration. State starts empty; call
    /// [`FocusMonitor::restore`] to load what is on disk.
    pub fn new(config: &Config, paths: Paths, analyzer: Arc<dyn Analyzer>) -> Self {
        let state = create_shared_session(SessionState::new());
        let store = SessionStore::new(&paths.sessions_dir);
        let cycle = CaptureCycle::from_config(
            config,
            paths.clone(),
            analyzer,
            state.clone(),
            store.clone(),
        );
        Self::assemble(paths, state, store, cycle, config.capture_interval)
    }

    /// Build a monitor around explicit capture programs.
    pub fn with_programs(
        paths: Paths,
        image: CaptureProgram,
        audio: CaptureProgram,
        analyzer: Arc<dyn Analyzer>,
        interval: Duration,
    ) -> Self {
        let state = create_shared_session(SessionState::new());
        let store = SessionStore::new(&paths.sessions_dir);
        let cycle = CaptureCycle::new(
            image,
            audio,
            analyzer,
            paths.clone(),
            state.clone(),
            store.clone(),
        );
        Self::assemble(paths, state, store, cycle, interval)
    }

    fn assemble(
        paths: Paths,
        state: SharedSession,
        store: SessionStore,
        cycle: CaptureCycle,
        interval: Duration,
    ) -> Self {
        Self {
            paths,
            state,
            store,
            archive: Mutex::new(Vec::new()),
            cycle: Arc::new(cycle),
            scheduler: Scheduler::new(interval),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Load the checkpoint and archived sessions, resuming an in-flight
    /// session's scheduler.
    ///
    /// Nothing here is fatal: a corrupt checkpoint is reported and the
    /// monitor continues with empty state. Must run inside a Tokio runtime.
    pub fn restore(&self) {
        let mut archive = self.archive.lock();

        match self.store.load_archives() {
            Ok(sessions) => {
                info!("Loaded {} archived sessions", sessions.len());
                *archive = sessions;
            }
            Err(e) => error!("Failed to load archived sessions: {}", e),
        }

        let restored = match self.store.load_checkpoint() {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!("No checkpoint found, starting fresh");
                return;
            }
            Err(e) => {
                error!("Failed to load checkpoint, starting with empty state: {}", e);
                return;
            }
        };

        let active = restored.is_active();
        if active {
            info!(
                "Resuming session {} ({} samples)",
                restored.session_id().unwrap_or_default(),
                restored.samples_count()
            );
        }
        *self.state.lock() = restored;

        if active {
            self.scheduler.start(self.cycle.clone());
        }
    }

    /// Current dashboard view.
    pub fn snapshot(&self) -> StudyStats {
        let latest_url = self
            .paths
            .latest_image()
            .is_file()
            .then(|| LATEST_IMAGE_URL.to_string());
        self.state.lock().stats(Utc::now(), latest_url)
    }

    /// Begin a new session and start periodic capture. Returns the session id.
    ///
    /// Starting while a session is already active begins a fresh one; the
    /// running session's samples are discarded without an archive.
    pub fn start_session(&self) -> String {
        let archive = self.archive.lock();
        let now = Utc::now();

        let id = {
            let mut state = self.state.lock();
            if let Some(previous) = state.session_id() {
                warn!("Session {} replaced before it was stopped", previous);
            }
            // Files on disk count too: an unreadable archive is skipped at
            // load but still occupies its name.
            let id = unique_session_id(session_id_at(now), |id| {
                archive.iter().any(|s| s.id == id) || self.store.archive_path(id).exists()
            });
            state.begin(id.clone(), now);
            id
        };
        info!("Session {} started", id);

        self.scheduler.start(self.cycle.clone());
        self.store.checkpoint_shared(&self.state);
        id
    }

    /// Stop the session and periodic capture. Returns the archived record if
    /// a session was active.
    ///
    /// An in-flight capture cycle still completes and records its sample.
    pub fn stop_session(&self) -> Option<Session> {
        let mut archive = self.archive.lock();

        let finished = self.state.lock().end(Utc::now());
        self.scheduler.stop();

        if let Some(session) = &finished {
            info!(
                "Session {} stopped after {} samples",
                session.id, session.samples_count
            );
            match self.store.archive(session) {
                Ok(_) => archive.push(session.clone()),
                Err(e) => error!("Failed to archive session {}: {}", session.id, e),
            }
        }

        self.store.checkpoint_shared(&self.state);
        finished
    }

    /// Run one capture cycle now, independent of the scheduler.
    pub async fn capture_once(&self) -> Result<Analysis, CycleError> {
        self.cycle.run().await
    }

    /// Archived sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.archive.lock().iter().map(SessionSummary::from).collect()
    }

    /// The archived session that began at `start`.
    pub fn session_started_at(&self, start: DateTime<Utc>) -> Option<Session> {
        self.archive
            .lock()
            .iter()
            .find(|s| s.start == start)
            .cloned()
    }

    /// Stop periodic capture without touching the session.
    ///
    /// Used at shutdown so the checkpoint still shows the session as active
    /// and the next start resumes it.
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }
}
