//! Service configuration, loaded from JSON with per-field defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recognition::infrastructure::execution_provider::{
    preferred_backends, ExecutionBackend,
};
use crate::shared::constants::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_DEBOUNCE_INTERVAL, DEFAULT_MATCH_THRESHOLD,
    DEFAULT_MAX_IDLE, DEFAULT_REAP_INTERVAL,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Capture-thread behaviour for every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub buffer_capacity: usize,
    /// Failed reads tolerated before the source is reopened.
    pub max_consecutive_errors: u32,
    /// Failed reopens after which the connection is given up.
    pub max_reopen_attempts: u32,
    pub reopen_delay_ms: u64,
    pub read_retry_delay_ms: u64,
    pub frame_pause_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_consecutive_errors: 5,
            max_reopen_attempts: 3,
            reopen_delay_ms: 2000,
            read_retry_delay_ms: 100,
            frame_pause_ms: 10,
            close_timeout_ms: 1000,
        }
    }
}

impl CaptureConfig {
    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn frame_pause(&self) -> Duration {
        Duration::from_millis(self.frame_pause_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Pacing of a consumer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub frame_interval_ms: u64,
    pub frame_retry_delay_ms: u64,
    /// Empty fetches in a row before a placeholder frame is emitted.
    pub placeholder_after_misses: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 30,
            frame_retry_delay_ms: 500,
            placeholder_after_misses: 5,
        }
    }
}

impl SessionConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn frame_retry_delay(&self) -> Duration {
        Duration::from_millis(self.frame_retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub match_threshold: f64,
    pub detection_confidence: f64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            detection_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    pub interval_secs: u64,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_DEBOUNCE_INTERVAL.as_secs(),
        }
    }
}

impl AttendanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    pub max_idle_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_REAP_INTERVAL.as_secs(),
            max_idle_secs: DEFAULT_MAX_IDLE.as_secs(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub capture: CaptureConfig,
    pub session: SessionConfig,
    pub recognition: RecognitionConfig,
    pub attendance: AttendanceConfig,
    pub reaper: ReaperConfig,
    pub gallery_dir: PathBuf,
    pub attendance_dir: PathBuf,
    pub models_dir: Option<PathBuf>,
    /// Inference backends, tried in order.
    pub backends: Vec<ExecutionBackend>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            session: SessionConfig::default(),
            recognition: RecognitionConfig::default(),
            attendance: AttendanceConfig::default(),
            reaper: ReaperConfig::default(),
            gallery_dir: PathBuf::from("dataset"),
            attendance_dir: PathBuf::from("attendance_logs"),
            models_dir: None,
            backends: preferred_backends(),
        }
    }
}

impl ServiceConfig {
    /// Platform config location: `<config dir>/Facegate/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("Facegate").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `explicit` if given, else the platform config file if present,
    /// else defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("capture.buffer_capacity must be >= 1".into()));
        }
        if self.capture.max_reopen_attempts == 0 {
            return Err(ConfigError::Invalid(
                "capture.max_reopen_attempts must be >= 1".into(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.recognition.match_threshold) {
            return Err(ConfigError::Invalid(
                "recognition.match_threshold must be within [-1, 1]".into(),
            ));
        }
        if self.attendance.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "attendance.interval_secs must be >= 1".into(),
            ));
        }
        if self.reaper.interval_secs == 0 {
            return Err(ConfigError::Invalid("reaper.interval_secs must be >= 1".into()));
        }
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid("backends must not be empty".into()));
        }
        Ok(())
    }
}
