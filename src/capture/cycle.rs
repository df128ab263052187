//! One sample-producing round: image, audio level, analysis, merge.

use super::types::{Artifact, CaptureError, CaptureKind};
use super::watchdog::CaptureProgram;
use crate::config::{Config, ConfigError, Paths};
use crate::inference::{Analysis, Analyzer, InferenceError};
use crate::scheduler::ScheduledJob;
use crate::session::{SessionStore, SharedSession};
use async_trait::async_trait;
use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why a capture cycle produced no sample.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to prepare capture directories: {0}")]
    Setup(#[source] ConfigError),

    #[error(transparent)]
    Image(#[from] CaptureError),

    #[error("failed to read audio level from {}: {reason}", .path.display())]
    AudioReading { path: PathBuf, reason: String },

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl CycleError {
    /// Whether the failure came from the inference service rather than local capture.
    pub fn is_upstream(&self) -> bool {
        matches!(self, CycleError::Inference(_))
    }
}

/// Outcome of the best-effort audio capture.
#[derive(Debug)]
pub enum AudioReading {
    Present(Artifact),
    /// The capture failed; the last reading on disk stands in for it.
    Absent { reason: CaptureError },
}

impl AudioReading {
    fn path<'a>(&'a self, fallback: &'a Path) -> &'a Path {
        match self {
            AudioReading::Present(artifact) => &artifact.path,
            AudioReading::Absent { .. } => fallback,
        }
    }
}

/// Runs capture cycles and merges their results into the shared session.
pub struct CaptureCycle {
    image: CaptureProgram,
    audio: CaptureProgram,
    analyzer: Arc<dyn Analyzer>,
    paths: Paths,
    state: SharedSession,
    store: SessionStore,
}

impl CaptureCycle {
    pub fn new(
        image: CaptureProgram,
        audio: CaptureProgram,
        analyzer: Arc<dyn Analyzer>,
        paths: Paths,
        state: SharedSession,
        store: SessionStore,
    ) -> Self {
        Self {
            image,
            audio,
            analyzer,
            paths,
            state,
            store,
        }
    }

    /// Build the capture programs described by `config`.
    pub fn from_config(
        config: &Config,
        paths: Paths,
        analyzer: Arc<dyn Analyzer>,
        state: SharedSession,
        store: SessionStore,
    ) -> Self {
        let program = |kind, script: &Path| {
            CaptureProgram::new(
                kind,
                vec![
                    config.interpreter.clone(),
                    paths.resolve(script).to_string_lossy().into_owned(),
                ],
            )
            .with_deadline(config.capture_deadline)
            .with_grace(config.termination_grace)
        };
        let image = program(CaptureKind::Image, &config.image_script)
            .with_latest_copy(paths.latest_image());
        let audio = program(CaptureKind::Audio, &config.audio_script);

        Self::new(image, audio, analyzer, paths, state, store)
    }

    /// Run one full cycle and record the sample.
    pub async fn run(&self) -> Result<Analysis, CycleError> {
        self.paths.ensure_directories().map_err(CycleError::Setup)?;

        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let image_dest = self.paths.images_dir.join(format!("capture-{stamp}.jpg"));
        let image = self.image.run(&image_dest).await?;

        let sentinel = self.paths.audio_reading();
        let audio = match self.audio.run(&sentinel).await {
            Ok(artifact) => AudioReading::Present(artifact),
            Err(reason) => {
                warn!("Audio capture failed, reusing last reading: {}", reason);
                AudioReading::Absent { reason }
            }
        };
        let decibels = read_decibels(audio.path(&sentinel)).await?;

        let analysis = self.analyzer.analyze(&image.path).await?;
        info!(
            focus_level = analysis.focus_level,
            is_focused = analysis.is_focused,
            is_away = analysis.is_away,
            decibels,
            "{}",
            analysis.summary
        );

        self.state
            .lock()
            .record_sample(image.path, analysis.clone(), decibels, Utc::now());
        self.store.checkpoint_shared(&self.state);

        Ok(analysis)
    }
}

#[async_trait]
impl ScheduledJob for CaptureCycle {
    async fn run_scheduled(&self) {
        if let Err(e) = self.run().await {
            error!("Capture cycle failed: {}", e);
        }
    }
}

/// Read the single decibel value an audio capture writes.
///
/// Silence is written as `-inf`; non-finite readings are recorded as 0 dB.
pub async fn read_decibels(path: &Path) -> Result<f64, CycleError> {
    let reading_error = |reason: String| CycleError::AudioReading {
        path: path.to_path_buf(),
        reason,
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| reading_error(e.to_string()))?;
    let value: f64 = content
        .trim()
        .parse()
        .map_err(|e| reading_error(format!("failed to parse float: {e}")))?;

    if value.is_finite() {
        Ok(value)
    } else {
        debug!("Non-finite audio level {} recorded as 0", value);
        Ok(0.0)
    }
}
