//! Configuration for the Focus Monitor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Images captured by the camera program, relative to the project root.
pub const IMAGES_DIR: &str = "BaseStation/data/images";
/// Session checkpoint and archives, relative to the project root.
pub const SESSIONS_DIR: &str = "BaseStation/data/sessions";
/// Dashboard assets, relative to the project root.
pub const STATIC_DIR: &str = "BaseStation/api/static";

/// Environment variables consulted for the inference API key, in order.
pub const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// How many parent directories to climb when looking for the project root.
const ROOT_SEARCH_DEPTH: usize = 6;

/// Main configuration for the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the HTTP API binds to on localhost
    pub port: u16,

    /// Explicit project root; discovered from the working directory when unset
    pub project_root: Option<PathBuf>,

    /// Interpreter used to launch the capture scripts
    pub interpreter: String,

    /// Camera capture script, relative to the project root
    pub image_script: PathBuf,

    /// Microphone capture script, relative to the project root
    pub audio_script: PathBuf,

    /// Delay between scheduled capture cycles
    #[serde(with = "duration_serde")]
    pub capture_interval: Duration,

    /// Hard limit on a single capture program run
    #[serde(with = "duration_serde")]
    pub capture_deadline: Duration,

    /// How long a capture program gets to exit after SIGTERM
    #[serde(with = "duration_serde")]
    pub termination_grace: Duration,

    /// Generative model used for focus analysis
    pub model: String,

    /// Base URL of the inference service
    pub inference_endpoint: String,

    /// Request timeout for the inference call
    #[serde(with = "duration_serde")]
    pub inference_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8085,
            project_root: None,
            interpreter: "python3".to_string(),
            image_script: PathBuf::from("wili/wileye.py"),
            audio_script: PathBuf::from("wili/audio.py"),
            capture_interval: Duration::from_secs(60),
            capture_deadline: Duration::from_secs(30),
            termination_grace: Duration::from_secs(2),
            model: "gemini-2.5-flash".to_string(),
            inference_endpoint: "https://generativelanguage.googleapis.com".to_string(),
            inference_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit file, falling back to defaults when it is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let config_path = Self::config_path();
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    /// Save configuration to an explicit file, creating its directory.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("focus-monitor")
            .join("config.json")
    }

    /// Resolve the on-disk layout for this configuration.
    ///
    /// An explicit `project_root` wins; otherwise the root is discovered from
    /// the working directory, and paths stay relative when nothing is found.
    pub fn paths(&self) -> Paths {
        let root = self.project_root.clone().or_else(|| {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| find_project_root(&cwd, &[&self.image_script, &self.audio_script]))
        });
        Paths::new(root.unwrap_or_default())
    }
}

/// Resolved filesystem layout rooted at the project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub root: PathBuf,
    pub images_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub static_dir: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            images_dir: root.join(IMAGES_DIR),
            sessions_dir: root.join(SESSIONS_DIR),
            static_dir: root.join(STATIC_DIR),
            root,
        }
    }

    /// Rolling copy of the most recent image.
    pub fn latest_image(&self) -> PathBuf {
        self.images_dir.join("latest.jpg")
    }

    /// Where the audio program writes its decibel reading.
    pub fn audio_reading(&self) -> PathBuf {
        self.images_dir.join("audio.txt")
    }

    /// Resolve a project-relative path (absolute paths pass through).
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.images_dir)?;
        std::fs::create_dir_all(&self.sessions_dir)?;
        Ok(())
    }
}

/// Walk upward from `start` looking for a directory that holds `.env`, `.git`,
/// or one of the given project-relative markers.
pub fn find_project_root(start: &Path, markers: &[&Path]) -> Option<PathBuf> {
    let mut dir = start;
    for _ in 0..ROOT_SEARCH_DEPTH {
        let found = dir.join(".env").exists()
            || dir.join(".git").exists()
            || markers.iter().any(|m| dir.join(m).exists());
        if found {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
    None
}

/// Load `KEY=VALUE` pairs from a dotenv file into the process environment.
///
/// Variables that are already set are left alone. Returns how many were applied.
pub fn load_dotenv(path: &Path) -> Result<usize, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut applied = 0;
    for (key, value) in parse_dotenv(&content) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, value);
            applied += 1;
        }
    }
    Ok(applied)
}

fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            let valid_key = key
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_key {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// First non-empty API key from [`API_KEY_VARS`].
pub fn api_key_from_env() -> Option<String> {
    API_KEY_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(serde_json::Error),
    #[error("Serialize error: {0}")]
    Serialize(serde_json::Error),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
