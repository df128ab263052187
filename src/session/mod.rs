//! Session state, persistence and the monitor that ties them to capture.

mod monitor;
mod state;
mod store;

pub use monitor::{FocusMonitor, LATEST_IMAGE_URL};
pub use state::{
    create_shared_session, session_id_at, unique_session_id, FocusPoint, Session,
    SessionState, SessionSummary, SharedSession, StudyStats,
};
pub use store::{SessionStore, StoreError, CHECKPOINT_FILE};
