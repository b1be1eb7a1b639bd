//! Media record types: the projection of conversion state the outside world
//! observes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::MediaId;
use crate::Error;

/// MIME type of every converted output.
pub const CONVERTED_MIME_TYPE: &str = "video/mp4";

// ---------------------------------------------------------------------------
// ConversionStatus
// ---------------------------------------------------------------------------

/// Conversion status of a media record.
///
/// `None` means no conversion is required and is terminal at creation.
/// `Completed` and `Failed` are terminal and only set once the job reached a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    None,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ConversionStatus {
    /// Lowercase string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further conversion transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::None | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!(
                "unknown conversion status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// MediaRecord
// ---------------------------------------------------------------------------

/// Persisted metadata and status for an uploaded media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: MediaId,
    /// Storage filename (replaced by the converted output's name on success).
    pub filename: String,
    pub mime_type: String,
    pub is_converted: bool,
    pub conversion_status: ConversionStatus,
    pub duration_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// MediaUpdate
// ---------------------------------------------------------------------------

/// Partial update applied to a media record. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaUpdate {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub is_converted: Option<bool>,
    pub conversion_status: Option<ConversionStatus>,
    pub duration_secs: Option<f64>,
}

impl MediaUpdate {
    /// Update only the conversion status.
    pub fn status(status: ConversionStatus) -> Self {
        Self {
            conversion_status: Some(status),
            ..Default::default()
        }
    }

    /// The full set of fields written after a successful conversion.
    pub fn converted(filename: impl Into<String>, duration_secs: Option<f64>) -> Self {
        Self {
            filename: Some(filename.into()),
            mime_type: Some(CONVERTED_MIME_TYPE.to_string()),
            is_converted: Some(true),
            conversion_status: Some(ConversionStatus::Completed),
            duration_secs,
        }
    }

    /// True when the update would not change anything.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            ConversionStatus::None,
            ConversionStatus::Pending,
            ConversionStatus::Processing,
            ConversionStatus::Completed,
            ConversionStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<ConversionStatus>().unwrap(), s);
        }
    }

    #[test]
    fn unknown_status_rejected() {
        assert!("queued".parse::<ConversionStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ConversionStatus::None.is_terminal());
        assert!(ConversionStatus::Completed.is_terminal());
        assert!(ConversionStatus::Failed.is_terminal());
        assert!(!ConversionStatus::Pending.is_terminal());
        assert!(!ConversionStatus::Processing.is_terminal());
    }

    #[test]
    fn converted_update_sets_all_fields() {
        let update = MediaUpdate::converted("abc.mp4", Some(12.5));
        assert_eq!(update.filename.as_deref(), Some("abc.mp4"));
        assert_eq!(update.mime_type.as_deref(), Some("video/mp4"));
        assert_eq!(update.is_converted, Some(true));
        assert_eq!(update.conversion_status, Some(ConversionStatus::Completed));
        assert_eq!(update.duration_secs, Some(12.5));
    }

    #[test]
    fn empty_update() {
        assert!(MediaUpdate::default().is_empty());
        assert!(!MediaUpdate::status(ConversionStatus::Failed).is_empty());
    }
}
