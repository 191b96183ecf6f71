pub mod exif;
pub mod guess;
pub mod video;

use std::path::Path;

use chrono::NaiveDateTime;

use crate::media::{MediaKind, TimeSource};

/// Result of date extraction: date + where it came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateResult {
    pub date: NaiveDateTime,
    pub source: TimeSource,
}

/// Extract a capture timestamp using all methods in priority order.
///
/// Embedded metadata beats the filename, which beats the filesystem clock.
pub fn extract_date(path: &Path, kind: MediaKind, use_filesystem_time: bool) -> Option<DateResult> {
    // 1. Embedded metadata
    let embedded = match kind {
        MediaKind::Photo => exif::read_exif_date(path).map(|date| DateResult {
            date,
            source: TimeSource::Exif,
        }),
        MediaKind::Video => video::probe_creation_time(path).map(|date| DateResult {
            date,
            source: TimeSource::VideoMetadata,
        }),
    };
    if embedded.is_some() {
        return embedded;
    }

    // 2. Filename guess
    let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if let Some(date) = guess::guess_date_from_filename(filename) {
        return Some(DateResult {
            date,
            source: TimeSource::Filename,
        });
    }

    // 3. Filesystem clock
    if use_filesystem_time {
        if let Some(date) = filesystem_time(path) {
            return Some(DateResult {
                date,
                source: TimeSource::Filesystem,
            });
        }
    }

    None
}

/// Birth time where the platform records it, else modification time.
pub fn filesystem_time(path: &Path) -> Option<NaiveDateTime> {
    let meta = std::fs::metadata(path).ok()?;
    let time = meta.created().or_else(|_| meta.modified()).ok()?;
    let local: chrono::DateTime<chrono::Local> = time.into();
    Some(local.naive_local())
}
