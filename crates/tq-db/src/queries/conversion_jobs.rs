//! Conversion job queue operations.
//!
//! Every mutation of an `active` job is fenced by its lease token: the
//! `WHERE lease = ?` guard makes a late writer whose job was requeued by the
//! stall detector a no-op, and callers turn the zero row count into a
//! conflict.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tq_core::{ConversionJob, ConversionJobId, Error, JobLease, JobState, MediaId, Result};

use crate::models::conversion_job_from_row;

pub const COLS: &str = "id, media_id, input_path, priority, attempts_made, max_attempts,
    state, progress, stall_count, created_at, processed_at, finished_at,
    failed_reason, available_at, heartbeat_at, lease, locked_by, output_path,
    duration_secs, media_synced";

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn query_jobs(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ConversionJob>> {
    let mut stmt = conn.prepare(sql).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map(params, conversion_job_from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Insert a new `waiting` job.
pub fn insert_job(
    conn: &Connection,
    media_id: MediaId,
    input_path: &Path,
    priority: i32,
    max_attempts: u32,
    now: i64,
) -> Result<ConversionJob> {
    let id = ConversionJobId::new();
    let q = format!(
        "INSERT INTO conversion_jobs (id, media_id, input_path, priority, max_attempts, state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'waiting', ?6)
         RETURNING {COLS}"
    );
    conn.query_row(
        &q,
        params![
            id.to_string(),
            media_id.to_string(),
            path_text(input_path),
            priority,
            max_attempts,
            now
        ],
        conversion_job_from_row,
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Get a conversion job by ID.
pub fn get_job(conn: &Connection, id: ConversionJobId) -> Result<Option<ConversionJob>> {
    let q = format!("SELECT {COLS} FROM conversion_jobs WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], conversion_job_from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// The unfinished job for a media record, if any.
pub fn find_open_for_media(conn: &Connection, media_id: MediaId) -> Result<Option<ConversionJob>> {
    let q = format!(
        "SELECT {COLS} FROM conversion_jobs
         WHERE media_id = ?1 AND state NOT IN ('completed', 'failed')"
    );
    conn.query_row(&q, [media_id.to_string()], conversion_job_from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Number of jobs currently in `state`.
pub fn count_in_state(conn: &Connection, state: JobState) -> Result<u64> {
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM conversion_jobs WHERE state = ?1",
            [state.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n.max(0) as u64)
}

/// Job counts grouped by persisted state.
pub fn count_by_state(conn: &Connection) -> Result<Vec<(JobState, u64)>> {
    let mut stmt = conn
        .prepare("SELECT state, COUNT(*) FROM conversion_jobs GROUP BY state")
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;

    rows.into_iter()
        .map(|(state, n)| Ok((state.parse::<JobState>()?, n.max(0) as u64)))
        .collect()
}

/// Move `delayed` jobs whose backoff has elapsed back to `waiting`.
pub fn promote_due(conn: &Connection, now: i64) -> Result<usize> {
    conn.execute(
        "UPDATE conversion_jobs SET state = 'waiting', available_at = NULL
         WHERE state = 'delayed' AND available_at <= ?1",
        [now],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Claim the next `waiting` job: lowest priority value first, then oldest.
///
/// Starts a new attempt (progress reset, `attempts_made` + 1, stall count
/// cleared) unless the job was requeued by the stall detector or released at
/// shutdown, in which case the interrupted attempt resumes without being
/// counted again.
pub fn claim_next(
    conn: &Connection,
    worker: &str,
    token: &str,
    now: i64,
) -> Result<Option<ConversionJob>> {
    let q = format!(
        "UPDATE conversion_jobs
         SET state = 'active', lease = ?1, locked_by = ?2, processed_at = ?3, heartbeat_at = ?3,
             progress = 0, available_at = NULL,
             attempts_made = MIN(max_attempts, attempts_made + 1 - resume_attempt),
             stall_count = CASE WHEN resume_attempt = 1 THEN stall_count ELSE 0 END,
             resume_attempt = 0
         WHERE id = (
             SELECT id FROM conversion_jobs WHERE state = 'waiting'
             ORDER BY priority ASC, created_at ASC, rowid ASC LIMIT 1
         )
         RETURNING {COLS}"
    );
    conn.query_row(&q, params![token, worker, now], conversion_job_from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Get the job only if `lease` still owns it.
pub fn get_leased(conn: &Connection, lease: &JobLease) -> Result<Option<ConversionJob>> {
    let q = format!(
        "SELECT {COLS} FROM conversion_jobs WHERE id = ?1 AND lease = ?2 AND state = 'active'"
    );
    conn.query_row(&q, params![lease.job_id.to_string(), lease.token], conversion_job_from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Raise progress (never lowers it) and refresh the heartbeat.
pub fn update_progress(conn: &Connection, lease: &JobLease, pct: u8, now: i64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs SET progress = MAX(progress, ?1), heartbeat_at = ?2
             WHERE id = ?3 AND lease = ?4 AND state = 'active'",
            params![pct.min(100), now, lease.job_id.to_string(), lease.token],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

pub fn touch_heartbeat(conn: &Connection, lease: &JobLease, now: i64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs SET heartbeat_at = ?1
             WHERE id = ?2 AND lease = ?3 AND state = 'active'",
            params![now, lease.job_id.to_string(), lease.token],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a leased job as completed, storing its output.
pub fn complete(
    conn: &Connection,
    lease: &JobLease,
    output_path: &Path,
    duration_secs: Option<f64>,
    now: i64,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs
             SET state = 'completed', progress = 100, finished_at = ?1, output_path = ?2,
                 duration_secs = ?3, failed_reason = NULL, lease = NULL, locked_by = NULL
             WHERE id = ?4 AND lease = ?5 AND state = 'active'",
            params![
                now,
                path_text(output_path),
                duration_secs,
                lease.job_id.to_string(),
                lease.token
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a leased job as terminally failed.
pub fn fail(conn: &Connection, lease: &JobLease, reason: &str, now: i64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs
             SET state = 'failed', finished_at = ?1, failed_reason = ?2, lease = NULL, locked_by = NULL
             WHERE id = ?3 AND lease = ?4 AND state = 'active'",
            params![now, reason, lease.job_id.to_string(), lease.token],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Park a leased job in `delayed` until `available_at`.
pub fn delay(conn: &Connection, lease: &JobLease, reason: &str, available_at: i64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs
             SET state = 'delayed', available_at = ?1, failed_reason = ?2, lease = NULL, locked_by = NULL
             WHERE id = ?3 AND lease = ?4 AND state = 'active'",
            params![available_at, reason, lease.job_id.to_string(), lease.token],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// `active` jobs whose last heartbeat is older than `cutoff`.
pub fn find_stalled(conn: &Connection, cutoff: i64) -> Result<Vec<ConversionJob>> {
    let q = format!(
        "SELECT {COLS} FROM conversion_jobs
         WHERE state = 'active' AND (heartbeat_at IS NULL OR heartbeat_at < ?1)
         ORDER BY rowid ASC"
    );
    query_jobs(conn, &q, [cutoff])
}

/// Put a stalled job back in `waiting` so its interrupted attempt resumes.
pub fn requeue_stalled(conn: &Connection, id: ConversionJobId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs
             SET state = 'waiting', lease = NULL, locked_by = NULL, heartbeat_at = NULL,
                 stall_count = stall_count + 1, resume_attempt = 1
             WHERE id = ?1 AND state = 'active'",
            [id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Hand an active job back to `waiting` on behalf of its lease holder. The
/// attempt resumes on the next claim and no stall is counted.
pub fn release(conn: &Connection, lease: &JobLease) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs
             SET state = 'waiting', lease = NULL, locked_by = NULL, heartbeat_at = NULL,
                 resume_attempt = 1
             WHERE id = ?1 AND lease = ?2 AND state = 'active'",
            params![lease.job_id.to_string(), lease.token],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Fail a job that stalled more often than allowed.
pub fn fail_stalled(conn: &Connection, id: ConversionJobId, reason: &str, now: i64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs
             SET state = 'failed', finished_at = ?1, failed_reason = ?2, stall_count = stall_count + 1,
                 lease = NULL, locked_by = NULL
             WHERE id = ?3 AND state = 'active'",
            params![now, reason, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Delete synced terminal jobs that finished before `cutoff`.
pub fn delete_finished_before(conn: &Connection, cutoff: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM conversion_jobs
         WHERE state IN ('completed', 'failed') AND media_synced = 1 AND finished_at < ?1",
        [cutoff],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Delete synced jobs in terminal `state` beyond the newest `keep`.
pub fn prune_state(conn: &Connection, state: JobState, keep: u32) -> Result<usize> {
    conn.execute(
        "DELETE FROM conversion_jobs
         WHERE state = ?1 AND media_synced = 1 AND id NOT IN (
             SELECT id FROM conversion_jobs WHERE state = ?1
             ORDER BY finished_at DESC, rowid DESC LIMIT ?2
         )",
        params![state.as_str(), keep],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Terminal jobs whose media record has not been updated yet.
pub fn list_unsynced_terminal(conn: &Connection) -> Result<Vec<ConversionJob>> {
    let q = format!(
        "SELECT {COLS} FROM conversion_jobs
         WHERE state IN ('completed', 'failed') AND media_synced = 0
         ORDER BY finished_at ASC"
    );
    query_jobs(conn, &q, [])
}

pub fn set_media_synced(conn: &Connection, id: ConversionJobId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs SET media_synced = 1 WHERE id = ?1",
            [id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;
    use std::path::PathBuf;

    fn lease_of(job: &ConversionJob) -> JobLease {
        JobLease {
            job_id: job.id,
            token: job.lease.clone().unwrap(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let media_id = MediaId::new();

        let job = insert_job(&conn, media_id, Path::new("/up/a.mkv"), 0, 3, 1_000).unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.input_path, PathBuf::from("/up/a.mkv"));

        let fetched = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(fetched, job);
        assert_eq!(find_open_for_media(&conn, media_id).unwrap().unwrap().id, job.id);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        assert!(get_job(&conn, ConversionJobId::new()).unwrap().is_none());
    }

    #[test]
    fn test_claim_orders_by_priority_then_age() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();

        let late = insert_job(&conn, MediaId::new(), Path::new("/a"), 5, 3, 1).unwrap();
        let first = insert_job(&conn, MediaId::new(), Path::new("/b"), 1, 3, 2).unwrap();
        let second = insert_job(&conn, MediaId::new(), Path::new("/c"), 1, 3, 3).unwrap();

        let order: Vec<_> = (0..3)
            .map(|i| claim_next(&conn, "w", &format!("t{i}"), 10).unwrap().unwrap().id)
            .collect();
        assert_eq!(order, vec![first.id, second.id, late.id]);
        assert!(claim_next(&conn, "w", "t4", 10).unwrap().is_none());
    }

    #[test]
    fn test_lease_guards_mutations() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        insert_job(&conn, MediaId::new(), Path::new("/a"), 0, 3, 1).unwrap();
        let job = claim_next(&conn, "w", "good", 2).unwrap().unwrap();

        let stale = JobLease {
            job_id: job.id,
            token: "stale".into(),
        };
        assert!(!update_progress(&conn, &stale, 50, 3).unwrap());
        assert!(!complete(&conn, &stale, Path::new("/out.mp4"), None, 3).unwrap());
        assert!(update_progress(&conn, &lease_of(&job), 50, 3).unwrap());
    }

    #[test]
    fn test_progress_never_decreases() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        insert_job(&conn, MediaId::new(), Path::new("/a"), 0, 3, 1).unwrap();
        let job = claim_next(&conn, "w", "tok", 2).unwrap().unwrap();
        let lease = lease_of(&job);

        update_progress(&conn, &lease, 60, 3).unwrap();
        update_progress(&conn, &lease, 40, 4).unwrap();
        assert_eq!(get_job(&conn, job.id).unwrap().unwrap().progress, 60);
    }

    #[test]
    fn test_promote_due_only_past_available_at() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        insert_job(&conn, MediaId::new(), Path::new("/a"), 0, 3, 1).unwrap();
        let job = claim_next(&conn, "w", "tok", 2).unwrap().unwrap();
        delay(&conn, &lease_of(&job), "boom", 100).unwrap();

        assert_eq!(promote_due(&conn, 99).unwrap(), 0);
        assert_eq!(promote_due(&conn, 100).unwrap(), 1);
        assert_eq!(get_job(&conn, job.id).unwrap().unwrap().state, JobState::Waiting);
    }

    #[test]
    fn test_count_by_state() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        insert_job(&conn, MediaId::new(), Path::new("/a"), 0, 3, 1).unwrap();
        insert_job(&conn, MediaId::new(), Path::new("/b"), 0, 3, 2).unwrap();
        claim_next(&conn, "w", "tok", 3).unwrap();

        let counts = count_by_state(&conn).unwrap();
        assert!(counts.contains(&(JobState::Waiting, 1)));
        assert!(counts.contains(&(JobState::Active, 1)));
        assert_eq!(count_in_state(&conn, JobState::Active).unwrap(), 1);
    }
}
