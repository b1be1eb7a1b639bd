//! Media record CRUD operations.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tq_core::{ConversionStatus, Error, MediaId, MediaRecord, MediaUpdate, Result};

use crate::models::{media_from_row, to_millis};

pub const COLS: &str =
    "id, filename, mime_type, is_converted, conversion_status, duration_secs, created_at, updated_at";

/// Create a new media record.
pub fn create_media(
    conn: &Connection,
    filename: &str,
    mime_type: &str,
    status: ConversionStatus,
) -> Result<MediaRecord> {
    let id = MediaId::new();
    let now = to_millis(Utc::now());
    let q = format!(
        "INSERT INTO media (id, filename, mime_type, is_converted, conversion_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)
         RETURNING {COLS}"
    );
    conn.query_row(
        &q,
        params![id.to_string(), filename, mime_type, status.as_str(), now],
        media_from_row,
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Get a media record by ID.
pub fn get_media(conn: &Connection, id: MediaId) -> Result<Option<MediaRecord>> {
    let q = format!("SELECT {COLS} FROM media WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], media_from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Apply the set fields of `fields`; returns `None` if the record is absent.
pub fn update_media(
    conn: &Connection,
    id: MediaId,
    fields: &MediaUpdate,
) -> Result<Option<MediaRecord>> {
    let now = to_millis(Utc::now());
    let q = format!(
        "UPDATE media SET
             filename          = COALESCE(?1, filename),
             mime_type         = COALESCE(?2, mime_type),
             is_converted      = COALESCE(?3, is_converted),
             conversion_status = COALESCE(?4, conversion_status),
             duration_secs     = COALESCE(?5, duration_secs),
             updated_at        = ?6
         WHERE id = ?7
         RETURNING {COLS}"
    );
    conn.query_row(
        &q,
        params![
            fields.filename,
            fields.mime_type,
            fields.is_converted,
            fields.conversion_status.map(|s| s.as_str()),
            fields.duration_secs,
            now,
            id.to_string()
        ],
        media_from_row,
    )
    .optional()
    .map_err(|e| Error::database(e.to_string()))
}
