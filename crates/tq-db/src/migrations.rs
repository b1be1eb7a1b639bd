//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.
//!
//! Timestamps are stored as INTEGER milliseconds since the Unix epoch so that
//! due-time and stall comparisons stay plain integer comparisons in SQL.

use rusqlite::Connection;
use tq_core::{Error, Result};

/// V1: initial schema -- media records, the conversion job queue and
/// queue-wide flags.
const V1_INITIAL: &str = r#"
-- Media records
CREATE TABLE media (
    id                TEXT PRIMARY KEY,
    filename          TEXT NOT NULL,
    mime_type         TEXT NOT NULL,
    is_converted      INTEGER NOT NULL DEFAULT 0,
    conversion_status TEXT NOT NULL DEFAULT 'none',
    duration_secs     REAL,
    created_at        INTEGER NOT NULL,
    updated_at        INTEGER NOT NULL
);

-- Conversion jobs
CREATE TABLE conversion_jobs (
    id             TEXT PRIMARY KEY,
    media_id       TEXT NOT NULL,
    input_path     TEXT NOT NULL,
    priority       INTEGER NOT NULL DEFAULT 0,
    attempts_made  INTEGER NOT NULL DEFAULT 0,
    max_attempts   INTEGER NOT NULL,
    state          TEXT NOT NULL DEFAULT 'waiting',
    progress       INTEGER NOT NULL DEFAULT 0,
    stall_count    INTEGER NOT NULL DEFAULT 0,
    resume_attempt INTEGER NOT NULL DEFAULT 0,
    created_at     INTEGER NOT NULL,
    processed_at   INTEGER,
    finished_at    INTEGER,
    failed_reason  TEXT,
    available_at   INTEGER,
    heartbeat_at   INTEGER,
    locked_by      TEXT,
    lease          TEXT,
    output_path    TEXT,
    duration_secs  REAL,
    media_synced   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_conversion_jobs_ready ON conversion_jobs(state, priority, created_at);
CREATE INDEX idx_conversion_jobs_finished ON conversion_jobs(state, finished_at);

-- At most one unfinished job per media record.
CREATE UNIQUE INDEX idx_conversion_jobs_open_media ON conversion_jobs(media_id)
    WHERE state NOT IN ('completed', 'failed');

-- Queue-wide flags (e.g. paused)
CREATE TABLE queue_state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// All migrations in order. Each entry is `(version, sql)`.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL)];

/// Run all pending migrations against the given connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;

        tracing::info!(version, "Applied database migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        // second call is a no-op
        run_migrations(&conn).unwrap();
    }

    #[test]
    fn test_all_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for t in ["media", "conversion_jobs", "queue_state", "schema_migrations"] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    [t],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "table {t} should exist");
        }
    }

    #[test]
    fn test_open_job_per_media_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO conversion_jobs (id, media_id, input_path, max_attempts, state, created_at)
                      VALUES (?1, 'm1', '/in.mkv', 3, ?2, 0)";
        conn.execute(insert, ["a", "completed"]).unwrap();
        conn.execute(insert, ["b", "waiting"]).unwrap();
        assert!(conn.execute(insert, ["c", "delayed"]).is_err());
    }
}
