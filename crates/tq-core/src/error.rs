//! Unified error type for the conversion queue.
//!
//! All crates funnel their failures into [`Error`]. The worker pool relies on
//! [`Error::is_transient`] to decide between another attempt and a terminal
//! failure.

use std::fmt;

/// Unified error type covering all failure modes in transcodeq.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "media").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// An identifier string could not be parsed.
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Input data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation raced with another owner (e.g. a lost job lease).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The source file of a conversion is gone.
    #[error("Input file missing: {path}")]
    MissingInput {
        /// Path that was expected to exist.
        path: String,
    },

    /// The durable job store cannot be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// An operation exceeded its wall-clock budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether another attempt of the same job may succeed.
    ///
    /// Tool crashes, disk pressure, timeouts and store hiccups are transient.
    /// Missing inputs, unknown or malformed records and lost leases are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database { .. }
            | Error::StoreUnavailable(_)
            | Error::Io { .. }
            | Error::Tool { .. }
            | Error::Timeout(_)
            | Error::Internal(_) => true,
            Error::NotFound { .. }
            | Error::InvalidId(_)
            | Error::Validation(_)
            | Error::Conflict(_)
            | Error::MissingInput { .. } => false,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::InvalidId(_) => "invalid_id",
            Error::Validation(_) => "validation_error",
            Error::Conflict(_) => "conflict",
            Error::MissingInput { .. } => "missing_input",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::Database { .. } => "database_error",
            Error::Io { .. } => "io_error",
            Error::Tool { .. } => "tool_error",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::MissingInput`].
    pub fn missing_input(path: impl AsRef<std::path::Path>) -> Self {
        Error::MissingInput {
            path: path.as_ref().display().to_string(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("job", "abc-123");
        assert_eq!(err.to_string(), "job not found: abc-123");
        assert_eq!(err.code(), "not_found");
        assert!(!err.is_transient());
    }

    #[test]
    fn store_unavailable_is_transient() {
        let err = Error::StoreUnavailable("connection refused".into());
        assert_eq!(err.to_string(), "Store unavailable: connection refused");
        assert!(err.is_transient());
    }

    #[test]
    fn tool_display() {
        let err = Error::tool("ffmpeg", "exit code 1");
        assert_eq!(err.to_string(), "Tool error [ffmpeg]: exit code 1");
        assert!(err.is_transient());
    }

    #[test]
    fn missing_input_is_terminal() {
        let err = Error::missing_input("/uploads/a.mkv");
        assert_eq!(err.to_string(), "Input file missing: /uploads/a.mkv");
        assert!(!err.is_transient());
    }

    #[test]
    fn timeout_is_transient() {
        let err = Error::Timeout("conversion exceeded 7200s".into());
        assert!(err.is_transient());
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn conflict_and_invalid_id_are_terminal() {
        assert!(!Error::Conflict("lease lost".into()).is_transient());
        assert!(!Error::InvalidId("zzz".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
    }

    #[test]
    fn database_display() {
        let err = Error::database("disk I/O error");
        assert!(err.to_string().contains("disk I/O error"));
        assert!(err.is_transient());
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.code(), "io_error");
    }
}
