use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use time::OffsetDateTime;

/// Upload lifecycle of a file record. `Finished` implies the assembled blob
/// is readable at the path derived from `(user_id, file_hash, filename)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileStatus {
    Uploading,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TranscodeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TranscodeStatus {
    /// Terminal states freeze `progress` and `result_urls`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TranscodeStatus::Completed | TranscodeStatus::Failed)
    }
}

/// The closed set of output renditions. Scale and bitrate pairs follow the
/// encoder presets: 1080p/5000k, 720p/2500k, 480p/1000k, 360p/500k.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::P1080,
        Resolution::P720,
        Resolution::P480,
        Resolution::P360,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "1080p" => Some(Resolution::P1080),
            "720p" => Some(Resolution::P720),
            "480p" => Some(Resolution::P480),
            "360p" => Some(Resolution::P360),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Resolution::P1080 => "1080p",
            Resolution::P720 => "720p",
            Resolution::P480 => "480p",
            Resolution::P360 => "360p",
        }
    }

    /// Target `WxH` for the encoder's scale filter.
    pub const fn scale(self) -> (u32, u32) {
        match self {
            Resolution::P1080 => (1920, 1080),
            Resolution::P720 => (1280, 720),
            Resolution::P480 => (854, 480),
            Resolution::P360 => (640, 360),
        }
    }

    pub const fn bitrate(self) -> &'static str {
        match self {
            Resolution::P1080 => "5000k",
            Resolution::P720 => "2500k",
            Resolution::P480 => "1000k",
            Resolution::P360 => "500k",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable file record. One row per `(file_hash, user_id)`; `request_id` is
/// the idempotency token, unique when non-empty.
#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub file_hash: String,
    pub user_id: String,
    pub filename: String,
    pub file_size: i64,
    pub url: String,
    pub status: FileStatus,
    pub width: u16,
    pub height: u16,
    pub ref_count: i32,
    pub request_id: Option<String>,
    pub transcode_status: TranscodeStatus,
    pub transcode_urls: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl FileRecord {
    /// `transcode_urls` is a JSON text column; a malformed value decodes as
    /// empty rather than failing a read path.
    pub fn transcode_url_list(&self) -> Vec<String> {
        serde_json::from_str(&self.transcode_urls).unwrap_or_default()
    }
}

/// Durable transcode task. `resolutions` and `result_urls` are JSON text
/// columns; `result_urls` stays aligned with the successfully transcoded
/// entries of `resolutions`.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    pub id: i64,
    pub task_id: String,
    pub file_hash: String,
    pub user_id: String,
    pub resolutions: String,
    pub status: TranscodeStatus,
    pub progress: i32,
    pub result_urls: String,
    pub request_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TaskRecord {
    pub fn resolution_list(&self) -> Vec<String> {
        serde_json::from_str(&self.resolutions).unwrap_or_default()
    }

    pub fn result_url_list(&self) -> Vec<String> {
        serde_json::from_str(&self.result_urls).unwrap_or_default()
    }
}
