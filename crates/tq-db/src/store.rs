//! SQLite implementations of the `tq-core` store traits.
//!
//! Every state transition runs as a single statement or inside one
//! `BEGIN IMMEDIATE` transaction, so several pool processes sharing the same
//! database file never claim the same job twice.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tq_core::config::QueueConfig;
use tq_core::{
    BackoffPolicy, ConversionJob, ConversionJobId, ConversionStatus, Error, FailureDisposition,
    JobLease, JobResult, JobState, JobStore, LeasedJob, MediaId, MediaRecord, MediaStore,
    MediaUpdate, QueueStats, Result, StallReport, DEFAULT_MAX_ATTEMPTS,
};
use uuid::Uuid;

use crate::models::now_millis;
use crate::pool::{get_conn, DbPool};
use crate::queries::{conversion_jobs as jobs, media, queue_state};

/// Failure reason recorded when a job exceeds `max_stalled_count`.
pub const STALL_LIMIT_REASON: &str = "job stalled more than allowable limit";

fn begin(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| Error::database(e.to_string()))
}

fn commit(tx: Transaction<'_>) -> Result<()> {
    tx.commit().map_err(|e| Error::database(e.to_string()))
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn lease_lost(lease: &JobLease) -> Error {
    Error::Conflict(format!("job {} is no longer held by this lease", lease.job_id))
}

// ---------------------------------------------------------------------------
// StoreOptions
// ---------------------------------------------------------------------------

/// Queue policy applied by [`SqliteJobStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Attempts granted to newly enqueued jobs.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// System-wide ceiling on `active` jobs.
    pub max_active: usize,
    pub max_stalled_count: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            max_active: 2,
            max_stalled_count: 1,
        }
    }
}

impl From<&QueueConfig> for StoreOptions {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff: cfg.backoff(),
            max_active: cfg.concurrency,
            max_stalled_count: cfg.max_stalled_count,
        }
    }
}

// ---------------------------------------------------------------------------
// SqliteJobStore
// ---------------------------------------------------------------------------

/// Durable conversion job queue backed by the `conversion_jobs` table.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: DbPool,
    options: StoreOptions,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool, options: StoreOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl JobStore for SqliteJobStore {
    fn enqueue(
        &self,
        media_id: MediaId,
        input_path: &Path,
        priority: i32,
    ) -> Result<ConversionJobId> {
        let mut conn = get_conn(&self.pool)?;
        let tx = begin(&mut conn)?;

        if let Some(existing) = jobs::find_open_for_media(&tx, media_id)? {
            tracing::debug!(
                job_id = %existing.id,
                media_id = %media_id,
                "Media already has an open conversion job"
            );
            return Ok(existing.id);
        }

        let job = jobs::insert_job(
            &tx,
            media_id,
            input_path,
            priority,
            self.options.max_attempts.max(1),
            now_millis(),
        )?;
        commit(tx)?;
        Ok(job.id)
    }

    fn dequeue_next(&self, worker: &str) -> Result<Option<LeasedJob>> {
        let mut conn = get_conn(&self.pool)?;
        let tx = begin(&mut conn)?;

        if queue_state::is_paused(&tx)? {
            return Ok(None);
        }
        let active = jobs::count_in_state(&tx, JobState::Active)?;
        if active >= self.options.max_active as u64 {
            return Ok(None);
        }

        let now = now_millis();
        let promoted = jobs::promote_due(&tx, now)?;
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed jobs");
        }

        let token = Uuid::new_v4().to_string();
        let claimed = jobs::claim_next(&tx, worker, &token, now)?;
        commit(tx)?;

        Ok(claimed.map(|job| LeasedJob {
            lease: JobLease {
                job_id: job.id,
                token,
            },
            job,
        }))
    }

    fn report_progress(&self, lease: &JobLease, percent: u8) -> Result<()> {
        let conn = get_conn(&self.pool)?;
        if jobs::update_progress(&conn, lease, percent, now_millis())? {
            Ok(())
        } else {
            Err(lease_lost(lease))
        }
    }

    fn heartbeat(&self, lease: &JobLease) -> Result<bool> {
        let conn = get_conn(&self.pool)?;
        jobs::touch_heartbeat(&conn, lease, now_millis())
    }

    fn release(&self, lease: &JobLease) -> Result<bool> {
        let conn = get_conn(&self.pool)?;
        let released = jobs::release(&conn, lease)?;
        if released {
            tracing::debug!(job_id = %lease.job_id, "Released job back to waiting");
        }
        Ok(released)
    }

    fn mark_completed(&self, lease: &JobLease, result: &JobResult) -> Result<()> {
        let conn = get_conn(&self.pool)?;
        let done = jobs::complete(
            &conn,
            lease,
            &result.output_path,
            result.duration_secs,
            now_millis(),
        )?;
        if done {
            Ok(())
        } else {
            Err(lease_lost(lease))
        }
    }

    fn mark_failed(
        &self,
        lease: &JobLease,
        reason: &str,
        is_final: bool,
    ) -> Result<FailureDisposition> {
        let mut conn = get_conn(&self.pool)?;
        let tx = begin(&mut conn)?;

        let job = jobs::get_leased(&tx, lease)?.ok_or_else(|| lease_lost(lease))?;
        let now = now_millis();

        let disposition = if is_final || !job.has_attempts_left() {
            jobs::fail(&tx, lease, reason, now)?;
            FailureDisposition::Failed
        } else {
            let delay = self.options.backoff.delay_for(job.attempts_made);
            jobs::delay(&tx, lease, reason, now.saturating_add(millis(delay)))?;
            FailureDisposition::Retrying {
                attempts_made: job.attempts_made,
                delay,
            }
        };

        commit(tx)?;
        Ok(disposition)
    }

    fn detect_stalled(&self, heartbeat_timeout: Duration) -> Result<StallReport> {
        let mut conn = get_conn(&self.pool)?;
        let tx = begin(&mut conn)?;

        let now = now_millis();
        let cutoff = now.saturating_sub(millis(heartbeat_timeout));
        let mut report = StallReport::default();

        for job in jobs::find_stalled(&tx, cutoff)? {
            if job.stall_count + 1 > self.options.max_stalled_count {
                jobs::fail_stalled(&tx, job.id, STALL_LIMIT_REASON, now)?;
                if let Some(failed) = jobs::get_job(&tx, job.id)? {
                    report.failed.push(failed);
                }
            } else {
                jobs::requeue_stalled(&tx, job.id)?;
                report.requeued.push(job.id);
            }
        }

        commit(tx)?;
        Ok(report)
    }

    fn stats(&self) -> Result<QueueStats> {
        let conn = get_conn(&self.pool)?;
        let mut stats = QueueStats {
            paused: queue_state::is_paused(&conn)?,
            ..Default::default()
        };

        for (state, n) in jobs::count_by_state(&conn)? {
            match state {
                JobState::Waiting => stats.waiting = n,
                JobState::Active => stats.active = n,
                JobState::Completed => stats.completed = n,
                JobState::Failed => stats.failed = n,
                JobState::Delayed => stats.delayed = n,
                JobState::Stalled => {}
            }
        }
        stats.total = stats.waiting + stats.active + stats.delayed;
        Ok(stats)
    }

    fn get(&self, id: ConversionJobId) -> Result<Option<ConversionJob>> {
        let conn = get_conn(&self.pool)?;
        jobs::get_job(&conn, id)
    }

    fn find_open_for_media(&self, media_id: MediaId) -> Result<Option<ConversionJob>> {
        let conn = get_conn(&self.pool)?;
        jobs::find_open_for_media(&conn, media_id)
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        let conn = get_conn(&self.pool)?;
        queue_state::set_paused(&conn, paused)
    }

    fn is_paused(&self) -> Result<bool> {
        let conn = get_conn(&self.pool)?;
        queue_state::is_paused(&conn)
    }

    fn clean(&self, older_than: Duration) -> Result<usize> {
        let conn = get_conn(&self.pool)?;
        let cutoff = now_millis().saturating_sub(millis(older_than));
        jobs::delete_finished_before(&conn, cutoff)
    }

    fn prune_retention(&self, keep_completed: u32, keep_failed: u32) -> Result<usize> {
        let mut conn = get_conn(&self.pool)?;
        let tx = begin(&mut conn)?;
        let removed = jobs::prune_state(&tx, JobState::Completed, keep_completed)?
            + jobs::prune_state(&tx, JobState::Failed, keep_failed)?;
        commit(tx)?;
        Ok(removed)
    }

    fn unsynced_terminal(&self) -> Result<Vec<ConversionJob>> {
        let conn = get_conn(&self.pool)?;
        jobs::list_unsynced_terminal(&conn)
    }

    fn mark_media_synced(&self, id: ConversionJobId) -> Result<()> {
        let conn = get_conn(&self.pool)?;
        if jobs::set_media_synced(&conn, id)? {
            Ok(())
        } else {
            Err(Error::not_found("job", id))
        }
    }
}

// ---------------------------------------------------------------------------
// SqliteMediaStore
// ---------------------------------------------------------------------------

/// Media records backed by the `media` table.
#[derive(Clone)]
pub struct SqliteMediaStore {
    pool: DbPool,
}

impl SqliteMediaStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a record the way the upload side does before scheduling.
    pub fn create(
        &self,
        filename: &str,
        mime_type: &str,
        status: ConversionStatus,
    ) -> Result<MediaRecord> {
        let conn = get_conn(&self.pool)?;
        media::create_media(&conn, filename, mime_type, status)
    }
}

impl MediaStore for SqliteMediaStore {
    fn get(&self, id: MediaId) -> Result<Option<MediaRecord>> {
        let conn = get_conn(&self.pool)?;
        media::get_media(&conn, id)
    }

    fn update(&self, id: MediaId, fields: &MediaUpdate) -> Result<Option<MediaRecord>> {
        let conn = get_conn(&self.pool)?;
        media::update_media(&conn, id, fields)
    }
}
