use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic", "heif"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// Classify by extension allow-list (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Photo)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

/// Where a capture timestamp came from, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    Exif,
    VideoMetadata,
    Filename,
    Filesystem,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    /// Unique key of the file within a batch
    pub path: PathBuf,
    /// Just the filename
    pub filename: String,
    pub kind: MediaKind,
    pub capture_timestamp: Option<NaiveDateTime>,
    pub time_source: TimeSource,
    /// Position in the folder listing sorted by filename; doubles as the
    /// index of this file in the scanned list
    pub filename_order: usize,
    /// File size in bytes
    pub size: u64,
}

impl MediaFile {
    pub fn new(path: PathBuf, kind: MediaKind, filename_order: usize) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            filename,
            kind,
            capture_timestamp: None,
            time_source: TimeSource::None,
            filename_order,
            size: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: NaiveDateTime, source: TimeSource) -> Self {
        self.capture_timestamp = Some(timestamp);
        self.time_source = source;
        self
    }

    pub fn is_photo(&self) -> bool {
        self.kind == MediaKind::Photo
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Lowercased extension without the dot, empty if there is none.
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default()
    }
}
