//! Supervised runs of the external capture programs.
//!
//! A capture program is started with a destination path, announces the
//! finished artifact on its output, and is then asked to exit. The watchdog
//! bounds every run with a deadline and checks the artifact afterwards.

mod cycle;
mod types;
mod watchdog;

pub use cycle::{read_decibels, AudioReading, CaptureCycle, CycleError};
pub use types::{Artifact, CaptureError, CaptureKind, LineEvent, LineMatcher, DEVICE_TIMEOUT_LINE};
pub use watchdog::{CaptureProgram, DEFAULT_DEADLINE, DEFAULT_GRACE};
