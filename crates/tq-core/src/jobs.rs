//! Conversion job domain types shared by the store and the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ids::{ConversionJobId, MediaId};
use crate::Error;

/// Default ceiling on execution attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a conversion job.
///
/// `Stalled` is never persisted: the stall detector moves rows straight from
/// `active` back to `waiting`, and the label only shows up in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
            Self::Delayed => "delayed",
        }
    }

    /// `completed` and `failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stalled" => Ok(Self::Stalled),
            "delayed" => Ok(Self::Delayed),
            other => Err(Error::Validation(format!("unknown job state '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ConversionJob
// ---------------------------------------------------------------------------

/// One unit of transcoding work tied to a media record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: ConversionJobId,
    pub media_id: MediaId,
    pub input_path: PathBuf,
    /// Lower values dequeue first.
    pub priority: i32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub state: JobState,
    /// Last reported completion, 0..=100.
    pub progress: u8,
    pub stall_count: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    /// Earliest time a `delayed` job may run again.
    pub available_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Token of the worker currently holding the job.
    pub lease: Option<String>,
    pub output_path: Option<PathBuf>,
    pub duration_secs: Option<f64>,
    /// Whether the media record reflects this job's terminal state.
    pub media_synced: bool,
}

impl ConversionJob {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a failed attempt may be followed by another one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// Proof of ownership over an `active` job, handed out by `dequeue_next`.
///
/// Every mutation the worker performs is fenced by the token: once a stall
/// requeue clears it, a late writer is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLease {
    pub job_id: ConversionJobId,
    pub token: String,
}

/// A dequeued job together with its lease.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: ConversionJob,
    pub lease: JobLease,
}

/// Output of a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub output_path: PathBuf,
    pub duration_secs: Option<f64>,
}

/// What the store did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The job is `delayed` and becomes eligible again after `delay`.
    Retrying { attempts_made: u32, delay: Duration },
    /// The job is terminally `failed`.
    Failed,
}

/// Outcome of one stall detection sweep.
#[derive(Debug, Clone, Default)]
pub struct StallReport {
    /// Jobs moved back to `waiting` without consuming an attempt.
    pub requeued: Vec<ConversionJobId>,
    /// Jobs that stalled too often and were failed terminally.
    pub failed: Vec<ConversionJob>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// Exponential retry schedule: `base × 2^(attempts_made − 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the attempt following attempt number `attempts_made`.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(3600))
    }
}

// ---------------------------------------------------------------------------
// Inspection shapes
// ---------------------------------------------------------------------------

/// Queue-wide job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
    /// Jobs not yet finished: `waiting + active + delayed`.
    pub total: u64,
}

/// Administrative view of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: ConversionJobId,
    pub media_id: MediaId,
    pub input_path: PathBuf,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&ConversionJob> for JobInfo {
    fn from(job: &ConversionJob) -> Self {
        Self {
            id: job.id,
            media_id: job.media_id,
            input_path: job.input_path.clone(),
            state: job.state,
            progress: job.progress,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            failed_reason: job.failed_reason.clone(),
            created_at: job.created_at,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(300));
        assert_eq!(policy.delay_for(4), Duration::from_secs(300));
        assert_eq!(policy.delay_for(200), Duration::from_secs(300));
    }

    #[test]
    fn backoff_zero_attempts_uses_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
    }

    #[test]
    fn job_state_round_trip() {
        for s in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Stalled,
            JobState::Delayed,
        ] {
            assert_eq!(s.as_str().parse::<JobState>().unwrap(), s);
        }
        assert!("queued".parse::<JobState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }
}
