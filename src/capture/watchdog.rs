//! Supervised runs of external capture programs.
//!
//! A capture program is started as `<command...> --dest <path>`. Both of its
//! output streams are read line by line; the first completion line (or the
//! device's own timeout line) ends the wait, after which the program is asked
//! to exit with SIGTERM and killed if it lingers past the grace window. The
//! whole run is bounded by an absolute deadline.
//!
//! ```text
//! Running ──(marker line)──▶ Signaled ──(exit)──────▶ ExitedCleanly
//!    │                           │
//!    │                           └──(grace elapsed)─▶ ForceKilled
//!    └──(deadline, at any point)──▶ Timeout
//! ```
//!
//! Whatever the process reports, the run only succeeds when the artifact at
//! the destination exists and is non-empty afterwards.

use super::types::{Artifact, CaptureError, CaptureKind, LineEvent, LineMatcher};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

/// Default bound on one capture program run.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
/// Default time a signaled program gets to exit on its own.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Progress of the escalating shutdown once a marker line was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Signaled,
    ExitedCleanly,
    ForceKilled,
}

/// How the supervised wait ended, before the artifact check.
enum Wait {
    Marker(LineEvent),
    Exited(std::io::Result<ExitStatus>),
    Deadline,
}

/// One external capture program and how to supervise it.
#[derive(Debug, Clone)]
pub struct CaptureProgram {
    kind: CaptureKind,
    /// Program followed by its leading arguments; `--dest <path>` is appended.
    command: Vec<String>,
    deadline: Duration,
    grace: Duration,
    latest_copy: Option<PathBuf>,
    matcher: LineMatcher,
}

impl CaptureProgram {
    /// Create a program with the default deadline and grace window.
    pub fn new(kind: CaptureKind, command: Vec<String>) -> Self {
        Self {
            kind,
            command,
            deadline: DEFAULT_DEADLINE,
            grace: DEFAULT_GRACE,
            latest_copy: None,
            matcher: LineMatcher::for_kind(kind),
        }
    }

    /// Set the absolute deadline for a run.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the grace window between SIGTERM and a forced kill.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Mirror every successful artifact to a fixed path.
    pub fn with_latest_copy(mut self, path: impl Into<PathBuf>) -> Self {
        self.latest_copy = Some(path.into());
        self
    }

    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    /// Run the program once, writing its artifact to `dest`.
    pub async fn run(&self, dest: &Path) -> Result<Artifact, CaptureError> {
        let kind = self.kind;
        let (program, args) = self.command.split_first().ok_or_else(|| {
            CaptureError::StartFailed {
                kind,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            }
        })?;

        let mut child = Command::new(program)
            .args(args)
            .arg("--dest")
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::StartFailed { kind, source })?;

        debug!(kind = %kind, pid = ?child.id(), dest = %dest.display(), "capture program started");

        let (marker_tx, mut marker_rx) = mpsc::channel(1);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, "stdout", marker_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, "stderr", marker_tx.clone()));
        }
        drop(marker_tx);

        let outcome = self
            .supervise(&mut child, &mut marker_rx, &mut readers)
            .await;

        for reader in &readers {
            reader.abort();
        }
        outcome?;

        let artifact = match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Artifact {
                kind,
                path: dest.to_path_buf(),
                size: meta.len(),
            },
            _ => {
                return Err(CaptureError::EmptyOrMissingArtifact {
                    kind,
                    path: dest.to_path_buf(),
                })
            }
        };

        if let Some(latest) = &self.latest_copy {
            if let Err(e) = copy_latest(dest, latest).await {
                warn!(kind = %kind, "Failed to update {}: {}", latest.display(), e);
            }
        }

        info!(kind = %kind, path = %artifact.path.display(), bytes = artifact.size, "capture complete");
        Ok(artifact)
    }

    /// Wait for the first marker line, process exit, or the deadline, and see
    /// the process through to termination.
    async fn supervise(
        &self,
        child: &mut Child,
        markers: &mut mpsc::Receiver<LineEvent>,
        readers: &mut [JoinHandle<()>],
    ) -> Result<(), CaptureError> {
        let kind = self.kind;
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        let wait = tokio::select! {
            biased;
            Some(event) = markers.recv() => Wait::Marker(event),
            status = child.wait() => Wait::Exited(status),
            _ = &mut deadline => Wait::Deadline,
        };

        match wait {
            Wait::Marker(event) => {
                if event == LineEvent::TerminalError {
                    info!(kind = %kind, "capture program reported a device timeout, treating as finished");
                }
                let termination = self.terminate(child, deadline).await?;
                debug!(kind = %kind, ?termination, "capture program stopped");
                Ok(())
            }
            Wait::Exited(status) => {
                // The marker may still be in flight on a reader when the
                // process exits right after printing it.
                let drain_until = Instant::now() + self.grace;
                for reader in readers.iter_mut() {
                    let _ = tokio::time::timeout_at(drain_until, reader).await;
                }
                if markers.try_recv().is_ok() {
                    return Ok(());
                }
                match status {
                    Ok(status) if status.success() => Err(CaptureError::IncompleteSignal { kind }),
                    Ok(status) => Err(CaptureError::ProcessExited {
                        kind,
                        code: status.code(),
                    }),
                    Err(e) => {
                        warn!(kind = %kind, "Failed to wait for capture program: {}", e);
                        Err(CaptureError::ProcessExited { kind, code: None })
                    }
                }
            }
            Wait::Deadline => {
                warn!(kind = %kind, "capture program exceeded {}s deadline, killing", self.deadline.as_secs());
                force_kill(child).await;
                Err(CaptureError::Timeout {
                    kind,
                    after: self.deadline,
                })
            }
        }
    }

    /// Escalate from SIGTERM to a forced kill; the deadline still applies.
    async fn terminate(
        &self,
        child: &mut Child,
        mut deadline: std::pin::Pin<&mut Sleep>,
    ) -> Result<Termination, CaptureError> {
        if let Err(e) = request_termination(child) {
            debug!(kind = %self.kind, "SIGTERM not delivered: {}", e);
        }
        debug!(kind = %self.kind, state = ?Termination::Signaled, "waiting {:?} for exit", self.grace);

        let state = tokio::select! {
            biased;
            _ = child.wait() => Termination::ExitedCleanly,
            _ = tokio::time::sleep(self.grace) => {
                debug!(kind = %self.kind, "capture program ignored SIGTERM, killing");
                force_kill(child).await;
                Termination::ForceKilled
            }
            _ = &mut deadline => {
                warn!(kind = %self.kind, "capture program exceeded {}s deadline while stopping", self.deadline.as_secs());
                force_kill(child).await;
                return Err(CaptureError::Timeout {
                    kind: self.kind,
                    after: self.deadline,
                });
            }
        };

        Ok(state)
    }

    fn spawn_reader<R>(
        &self,
        stream: R,
        stream_name: &'static str,
        markers: mpsc::Sender<LineEvent>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let kind = self.kind;
        let matcher = self.matcher.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\r', '\n']);
                        info!(kind = %kind, stream = stream_name, "{}", line);
                        let event = matcher.classify(line);
                        if event != LineEvent::Other {
                            // Only the first marker matters.
                            let _ = markers.try_send(event);
                        }
                    }
                    Err(e) => {
                        debug!(kind = %kind, stream = stream_name, "read failed: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from),
        // Already reaped.
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

async fn force_kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("kill failed: {}", e);
    }
}

/// Copy through a temporary sibling so readers never see a partial file.
async fn copy_latest(src: &Path, latest: &Path) -> std::io::Result<()> {
    let tmp = latest.with_extension("partial");
    tokio::fs::copy(src, &tmp).await?;
    tokio::fs::rename(&tmp, latest).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> Vec<String> {
        let path = dir.path().join("capture.sh");
        std::fs::write(&path, body).unwrap();
        vec!["sh".to_string(), path.to_string_lossy().into_owned()]
    }

    fn program(kind: CaptureKind, command: Vec<String>) -> CaptureProgram {
        CaptureProgram::new(kind, command)
            .with_deadline(Duration::from_secs(5))
            .with_grace(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_success_line_then_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(
            &dir,
            "echo connecting\nprintf 'jpegdata' > \"$2\"\necho \"Image saved to: $2\"\nexec sleep 30\n",
        );

        let started = StdInstant::now();
        let artifact = program(CaptureKind::Image, cmd).run(&dest).await.unwrap();

        assert_eq!(artifact.path, dest);
        assert_eq!(artifact.size, 8);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_exit_zero_without_marker_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(&dir, "printf 'data' > \"$2\"\necho done\nexit 0\n");

        let err = program(CaptureKind::Image, cmd).run(&dest).await.unwrap_err();
        assert!(matches!(err, CaptureError::IncompleteSignal { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_marker_then_own_exit_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("level.txt");
        let cmd = script(&dir, "printf '52.5' > \"$2\"\necho \"Audio saved to: $2\"\nexit 0\n");

        let artifact = program(CaptureKind::Audio, cmd).run(&dest).await.unwrap();
        assert_eq!(artifact.kind, CaptureKind::Audio);
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(&dir, "echo 'No FreeWili devices found' >&2\nexit 3\n");

        let err = program(CaptureKind::Image, cmd).run(&dest).await.unwrap_err();
        assert!(
            matches!(err, CaptureError::ProcessExited { code: Some(3), .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_empty_artifact_after_marker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(&dir, ": > \"$2\"\necho \"Image saved to: $2\"\nexec sleep 30\n");

        let err = program(CaptureKind::Image, cmd).run(&dest).await.unwrap_err();
        assert!(
            matches!(err, CaptureError::EmptyOrMissingArtifact { .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_missing_artifact_after_marker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(&dir, "echo \"Image saved to: $2\"\nexec sleep 30\n");

        let err = program(CaptureKind::Image, cmd).run(&dest).await.unwrap_err();
        assert!(
            matches!(err, CaptureError::EmptyOrMissingArtifact { .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_device_timeout_line_counts_as_finished() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(
            &dir,
            "printf 'partial' > \"$2\"\necho 'Error: Failed to read response frame in 6.0 seconds' >&2\nexec sleep 30\n",
        );

        let artifact = program(CaptureKind::Image, cmd).run(&dest).await.unwrap();
        assert_eq!(artifact.size, 7);
    }

    #[tokio::test]
    async fn test_device_timeout_line_still_checks_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(
            &dir,
            "echo 'Error: Failed to read response frame in 6.0 seconds'\nexec sleep 30\n",
        );

        let err = program(CaptureKind::Image, cmd).run(&dest).await.unwrap_err();
        assert!(matches!(err, CaptureError::EmptyOrMissingArtifact { .. }));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_is_force_killed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(
            &dir,
            "trap '' TERM\nprintf 'jpeg' > \"$2\"\necho \"Image saved to: $2\"\nexec sleep 30\n",
        );

        let started = StdInstant::now();
        let artifact = program(CaptureKind::Image, cmd).run(&dest).await.unwrap();
        assert_eq!(artifact.size, 4);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_deadline_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(&dir, "echo waiting\nexec sleep 30\n");

        let err = CaptureProgram::new(CaptureKind::Image, cmd)
            .with_deadline(Duration::from_millis(300))
            .run(&dest)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_deadline_supersedes_pending_success() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = script(
            &dir,
            "trap '' TERM\nprintf 'jpeg' > \"$2\"\necho \"Image saved to: $2\"\nexec sleep 30\n",
        );

        let err = CaptureProgram::new(CaptureKind::Image, cmd)
            .with_deadline(Duration::from_millis(500))
            .with_grace(Duration::from_secs(10))
            .run(&dest)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture.jpg");
        let cmd = vec![dir.path().join("missing-program").to_string_lossy().into_owned()];

        let err = program(CaptureKind::Image, cmd).run(&dest).await.unwrap_err();
        assert!(matches!(err, CaptureError::StartFailed { .. }), "{err}");

        let err = program(CaptureKind::Image, Vec::new())
            .run(&dest)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::StartFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_latest_copy_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture-1.jpg");
        let latest = dir.path().join("latest.jpg");
        let cmd = script(&dir, "printf 'frame' > \"$2\"\necho \"Image saved to: $2\"\nexec sleep 30\n");

        program(CaptureKind::Image, cmd)
            .with_latest_copy(&latest)
            .run(&dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&latest).unwrap(), b"frame");
    }
}
