//! Row mapping from SQLite into the `tq-core` domain types.
//!
//! Each mapper builds its value from a `rusqlite::Row` laid out in the
//! column order of the matching query module's `COLS` constant.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use tq_core::{ConversionJob, ConversionStatus, JobState, MediaRecord};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))?;
    Ok(T::from(uuid))
}

/// Parse a lowercase enum label from a text column.
fn parse_label<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_u32(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<u32> {
    let v: i64 = row.get(idx)?;
    u32::try_from(v).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn get_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Ok(from_millis(ms))
}

fn get_opt_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    Ok(ms.map(from_millis))
}

/// Milliseconds since the Unix epoch, the storage format for timestamps.
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Current time in storage format.
pub fn now_millis() -> i64 {
    to_millis(Utc::now())
}

// ---------------------------------------------------------------------------
// ConversionJob
// ---------------------------------------------------------------------------

/// Map a row selected with `queries::conversion_jobs::COLS`.
pub fn conversion_job_from_row(row: &rusqlite::Row) -> rusqlite::Result<ConversionJob> {
    let state: JobState = parse_label(row, 6)?;
    let progress: i64 = row.get(7)?;
    let input_path: String = row.get(2)?;
    let output_path: Option<String> = row.get(17)?;

    Ok(ConversionJob {
        id: parse_id(row, 0)?,
        media_id: parse_id(row, 1)?,
        input_path: PathBuf::from(input_path),
        priority: row.get(3)?,
        attempts_made: get_u32(row, 4)?,
        max_attempts: get_u32(row, 5)?,
        state,
        progress: progress.clamp(0, 100) as u8,
        stall_count: get_u32(row, 8)?,
        created_at: get_time(row, 9)?,
        processed_at: get_opt_time(row, 10)?,
        finished_at: get_opt_time(row, 11)?,
        failed_reason: row.get(12)?,
        available_at: get_opt_time(row, 13)?,
        heartbeat_at: get_opt_time(row, 14)?,
        lease: row.get(15)?,
        // 16 is locked_by, informational only
        output_path: output_path.map(PathBuf::from),
        duration_secs: row.get(18)?,
        media_synced: row.get(19)?,
    })
}

// ---------------------------------------------------------------------------
// MediaRecord
// ---------------------------------------------------------------------------

/// Map a row selected with `queries::media::COLS`.
pub fn media_from_row(row: &rusqlite::Row) -> rusqlite::Result<MediaRecord> {
    let status: ConversionStatus = parse_label(row, 4)?;
    Ok(MediaRecord {
        id: parse_id(row, 0)?,
        filename: row.get(1)?,
        mime_type: row.get(2)?,
        is_converted: row.get(3)?,
        conversion_status: status,
        duration_secs: row.get(5)?,
        created_at: get_time(row, 6)?,
        updated_at: get_time(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let t = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(t), 1_700_000_000_123);
    }

    #[test]
    fn out_of_range_millis_clamp_to_epoch() {
        assert_eq!(from_millis(i64::MAX), DateTime::<Utc>::UNIX_EPOCH);
    }
}
