//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! store, queue, transcoder and tool sections. Every section defaults
//! sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::jobs::{BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub transcoder: TranscoderConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let q = &self.queue;

        if q.concurrency == 0 {
            warnings.push("queue.concurrency is 0; no job will ever run".into());
        }
        if q.max_attempts == 0 {
            warnings.push("queue.max_attempts is 0; treated as 1".into());
        }
        if q.backoff_max_secs < q.backoff_base_secs {
            warnings.push(format!(
                "queue.backoff_max_secs ({}) is below backoff_base_secs ({})",
                q.backoff_max_secs, q.backoff_base_secs
            ));
        }
        if q.heartbeat_interval_secs >= q.stall_timeout_secs {
            warnings.push(format!(
                "queue.heartbeat_interval_secs ({}) should be well below stall_timeout_secs ({}); \
                 healthy jobs will be reported as stalled",
                q.heartbeat_interval_secs, q.stall_timeout_secs
            ));
        }
        if q.job_timeout_secs == 0 {
            warnings.push("queue.job_timeout_secs is 0; every attempt will time out".into());
        }
        if self.transcoder.crf > 51 {
            warnings.push(format!(
                "transcoder.crf {} is outside the valid range 0-51",
                self.transcoder.crf
            ));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/transcodeq.db"),
        }
    }
}

/// Worker pool, retry, stall and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of `active` jobs system-wide.
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Wall-clock budget for one attempt.
    pub job_timeout_secs: u64,
    /// An `active` job without a heartbeat for this long is stalled.
    pub stall_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Stalls tolerated before a job is failed terminally.
    pub max_stalled_count: u32,
    pub poll_interval_ms: u64,
    pub keep_completed: u32,
    pub keep_failed: u32,
    /// Age past which `clean` removes terminal jobs.
    pub clean_older_than_secs: u64,
    /// How long shutdown waits for in-flight jobs before abandoning them.
    pub shutdown_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_secs: 60,
            backoff_max_secs: 3600,
            job_timeout_secs: 2 * 60 * 60,
            stall_timeout_secs: 30,
            heartbeat_interval_secs: 10,
            max_stalled_count: 1,
            poll_interval_ms: 2000,
            keep_completed: 100,
            keep_failed: 200,
            clean_older_than_secs: 24 * 60 * 60,
            shutdown_grace_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_max_secs.max(self.backoff_base_secs)),
        )
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn clean_older_than(&self) -> Duration {
        Duration::from_secs(self.clean_older_than_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Output location and codec flags handed to ffmpeg.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub output_dir: PathBuf,
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub crf: u32,
    pub pixel_format: String,
    /// Move the moov atom to the front for progressive playback.
    pub faststart: bool,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./uploads/videos"),
            video_codec: "libx264".into(),
            audio_codec: "aac".into(),
            preset: "fast".into(),
            crf: 23,
            pixel_format: "yuv420p".into(),
            faststart: true,
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}
