//! Focus Monitor - periodic camera and microphone sampling for study sessions.
//!
//! The monitor drives two external capture programs (a camera and a
//! microphone), sends every captured frame to a generative model for focus
//! analysis, and accumulates the results into a session time series served to
//! a local dashboard.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Focus Monitor                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Scheduler │──▶│ CaptureCycle │──▶│   Analyzer   │         │
//! │  │  (1 min)  │   │ image, audio │   │   (Gemini)   │         │
//! │  └───────────┘   └──────────────┘   └──────────────┘         │
//! │                         │                                     │
//! │                         ▼                                     │
//! │                  ┌──────────────┐   ┌──────────────┐         │
//! │  HTTP API ──────▶│ SessionState │──▶│ SessionStore │         │
//! │                  │   (locked)   │   │ (checkpoint) │         │
//! │                  └──────────────┘   └──────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use focus_monitor::{config::Config, inference::{GeminiClient, GeminiConfig}, FocusMonitor};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let config = Config::load().unwrap_or_default();
//! let analyzer = Arc::new(GeminiClient::new(GeminiConfig::from_config(&config)));
//! let monitor = FocusMonitor::new(&config, config.paths(), analyzer);
//! monitor.restore();
//!
//! let id = monitor.start_session();
//! println!("studying as {id}: {:?}", monitor.snapshot().status);
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod inference;
pub mod scheduler;
pub mod server;
pub mod session;

// Re-export key types at crate root for convenience
pub use capture::{Artifact, CaptureCycle, CaptureError, CaptureKind, CaptureProgram, CycleError};
pub use config::{Config, ConfigError, Paths};
pub use inference::{Analysis, Analyzer, GeminiClient, GeminiConfig, InferenceError};
pub use scheduler::{ScheduledJob, Scheduler, SchedulerState};
pub use session::{
    FocusMonitor, FocusPoint, Session, SessionState, SessionStore, SessionSummary, StoreError,
    StudyStats,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
