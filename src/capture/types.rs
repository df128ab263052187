//! Types shared by the capture runner and the capture cycle.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Line the capture programs print when the device stops answering.
///
/// The program has already given up by the time it prints this, so the runner
/// treats it as a final answer rather than waiting out the deadline.
pub const DEVICE_TIMEOUT_LINE: &str = r"Error: Failed to read response frame in 6\.0 seconds";

/// Which sensor a capture program reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Image,
    Audio,
}

impl CaptureKind {
    /// Pattern for the line announcing a finished artifact.
    pub fn success_pattern(&self) -> &'static str {
        match self {
            CaptureKind::Image => r"^Image saved to:",
            CaptureKind::Audio => r"^Audio saved to:",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Image => "image",
            CaptureKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled line patterns for one capture kind.
#[derive(Debug, Clone)]
pub struct LineMatcher {
    success: Regex,
    terminal: Vec<Regex>,
}

/// What a single line of program output means to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    /// The artifact is finalized.
    Completed,
    /// The program reported a definitive end state of its own.
    TerminalError,
    /// Progress chatter.
    Other,
}

impl LineMatcher {
    /// Built-in patterns for a capture kind.
    pub fn for_kind(kind: CaptureKind) -> Self {
        Self::new(kind.success_pattern(), &[DEVICE_TIMEOUT_LINE])
            .expect("built-in capture patterns are valid")
    }

    pub fn new(success: &str, terminal: &[&str]) -> Result<Self, regex::Error> {
        Ok(Self {
            success: Regex::new(success)?,
            terminal: terminal
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn classify(&self, line: &str) -> LineEvent {
        if self.success.is_match(line) {
            LineEvent::Completed
        } else if self.terminal.iter().any(|re| re.is_match(line)) {
            LineEvent::TerminalError
        } else {
            LineEvent::Other
        }
    }
}

/// A finished, non-empty capture artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: CaptureKind,
    pub path: PathBuf,
    pub size: u64,
}

/// Why a capture program run did not produce an artifact.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to start {kind} capture program: {source}")]
    StartFailed {
        kind: CaptureKind,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} capture timed out after {}s", .after.as_secs())]
    Timeout {
        kind: CaptureKind,
        after: std::time::Duration,
    },

    #[error("{kind} capture program exited: {}", exit_description(.code))]
    ProcessExited { kind: CaptureKind, code: Option<i32> },

    #[error("{kind} capture did not report completion")]
    IncompleteSignal { kind: CaptureKind },

    #[error("{kind} capture file missing or empty: {}", .path.display())]
    EmptyOrMissingArtifact { kind: CaptureKind, path: PathBuf },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl CaptureError {
    pub fn kind(&self) -> CaptureKind {
        match self {
            CaptureError::StartFailed { kind, .. }
            | CaptureError::Timeout { kind, .. }
            | CaptureError::ProcessExited { kind, .. }
            | CaptureError::IncompleteSignal { kind }
            | CaptureError::EmptyOrMissingArtifact { kind, .. } => *kind,
        }
    }
}
