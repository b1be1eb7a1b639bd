//! Storage seams the worker pool and queue controller run against.
//!
//! [`JobStore`] is the durable, prioritized, at-least-once work queue.
//! [`MediaStore`] is the persistence layer for media records. Both are
//! synchronous: implementations are expected to complete each call with a
//! single short transaction and never hold locks across calls.

use std::path::Path;
use std::time::Duration;

use crate::ids::{ConversionJobId, MediaId};
use crate::jobs::{
    ConversionJob, FailureDisposition, JobLease, JobResult, LeasedJob, QueueStats, StallReport,
};
use crate::media::{MediaRecord, MediaUpdate};
use crate::Result;

/// Durable work queue holding conversion jobs keyed by job id.
pub trait JobStore: Send + Sync {
    /// Record a new `waiting` job.
    ///
    /// Returns the id of the already open job when `media_id` has one, so a
    /// media item never has two jobs in flight. Fails with
    /// [`crate::Error::StoreUnavailable`] when the backing store is unreachable.
    fn enqueue(&self, media_id: MediaId, input_path: &Path, priority: i32)
        -> Result<ConversionJobId>;

    /// Atomically claim the next ready job for `worker`.
    ///
    /// Returns `None` when nothing is ready, the queue is paused, or the
    /// system-wide active limit is reached.
    fn dequeue_next(&self, worker: &str) -> Result<Option<LeasedJob>>;

    /// Record progress for the attempt. Never lowers the stored value.
    fn report_progress(&self, lease: &JobLease, percent: u8) -> Result<()>;

    /// Refresh liveness. Returns `false` when the lease is no longer held.
    fn heartbeat(&self, lease: &JobLease) -> Result<bool>;

    /// Move the job to `completed` and store its result.
    fn mark_completed(&self, lease: &JobLease, result: &JobResult) -> Result<()>;

    /// Record a failed attempt: back to `delayed` with backoff, or terminal.
    fn mark_failed(&self, lease: &JobLease, reason: &str, is_final: bool)
        -> Result<FailureDisposition>;

    /// Give an active job back to `waiting` without counting a stall or an
    /// attempt. Returns `false` when the lease is no longer held.
    fn release(&self, lease: &JobLease) -> Result<bool>;

    /// Requeue `active` jobs whose heartbeat is older than `heartbeat_timeout`.
    fn detect_stalled(&self, heartbeat_timeout: Duration) -> Result<StallReport>;

    fn stats(&self) -> Result<QueueStats>;

    fn get(&self, id: ConversionJobId) -> Result<Option<ConversionJob>>;

    /// The non-terminal job for `media_id`, if any.
    fn find_open_for_media(&self, media_id: MediaId) -> Result<Option<ConversionJob>>;

    fn set_paused(&self, paused: bool) -> Result<()>;

    fn is_paused(&self) -> Result<bool>;

    /// Delete terminal jobs that finished more than `older_than` ago.
    fn clean(&self, older_than: Duration) -> Result<usize>;

    /// Keep only the newest `keep_completed` / `keep_failed` terminal jobs.
    fn prune_retention(&self, keep_completed: u32, keep_failed: u32) -> Result<usize>;

    /// Terminal jobs whose media record has not been updated yet.
    fn unsynced_terminal(&self) -> Result<Vec<ConversionJob>>;

    fn mark_media_synced(&self, id: ConversionJobId) -> Result<()>;
}

/// Persistence for media records.
pub trait MediaStore: Send + Sync {
    fn get(&self, id: MediaId) -> Result<Option<MediaRecord>>;

    /// Apply `fields` and return the updated record, or `None` if absent.
    fn update(&self, id: MediaId, fields: &MediaUpdate) -> Result<Option<MediaRecord>>;
}
