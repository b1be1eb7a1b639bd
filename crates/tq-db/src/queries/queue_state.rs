//! Queue-wide key/value flags.

use rusqlite::{params, Connection, OptionalExtension};
use tq_core::{Error, Result};

const PAUSED_KEY: &str = "paused";

pub fn get_flag(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM queue_state WHERE key = ?1", [key], |row| row.get(0))
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

pub fn set_flag(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO queue_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

pub fn is_paused(conn: &Connection) -> Result<bool> {
    Ok(get_flag(conn, PAUSED_KEY)?.as_deref() == Some("1"))
}

pub fn set_paused(conn: &Connection, paused: bool) -> Result<()> {
    set_flag(conn, PAUSED_KEY, if paused { "1" } else { "0" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;

    #[test]
    fn test_paused_defaults_to_false() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        assert!(!is_paused(&conn).unwrap());
    }

    #[test]
    fn test_pause_and_resume() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        set_paused(&conn, true).unwrap();
        assert!(is_paused(&conn).unwrap());
        set_paused(&conn, false).unwrap();
        assert!(!is_paused(&conn).unwrap());
        assert_eq!(get_flag(&conn, "paused").unwrap().as_deref(), Some("0"));
    }
}
