use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;

use crate::cancel::{is_cancelled, CancellationToken};
use crate::date;
use crate::error::{Error, Result};
use crate::media::{MediaFile, MediaKind};
use crate::plan::{SkipReason, SkippedFile};
use crate::ThrottledProgress;

/// Result of scanning one input folder
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Photos and videos ordered by filename; `media[i].filename_order == i`
    pub media: Vec<MediaFile>,
    /// Entries that are neither photo nor video, or could not be read
    pub skipped: Vec<SkippedFile>,
}

/// List a folder (non-recursive) and classify its entries. No metadata is
/// read beyond the file size.
pub fn list_folder(folder: &Path) -> Result<ScanResult> {
    let unreadable = |source: std::io::Error| Error::UnreadableMedia {
        path: folder.to_path_buf(),
        source,
    };
    let entries = std::fs::read_dir(folder).map_err(unreadable)?;

    let mut found: Vec<(String, PathBuf, MediaKind, u64)> = Vec::new();
    let mut skipped = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("skipping unreadable entry in {}: {}", folder.display(), e);
                continue;
            }
        };
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                log::warn!("skipping {}: {}", path.display(), e);
                skipped.push(SkippedFile {
                    path,
                    reason: SkipReason::Unreadable { detail: e.to_string() },
                });
                continue;
            }
        };
        if metadata.is_dir() {
            log::debug!("not descending into {}", path.display());
            continue;
        }

        match MediaKind::from_path(&path) {
            Some(kind) => {
                let filename = entry.file_name().to_string_lossy().into_owned();
                found.push((filename, path, kind, metadata.len()));
            }
            None => {
                let mime = mime_guess::from_path(&path).first().map(|m| m.to_string());
                log::debug!("skipping {} ({})", path.display(), mime.as_deref().unwrap_or("unknown type"));
                skipped.push(SkippedFile {
                    path,
                    reason: SkipReason::Unsupported { mime },
                });
            }
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    skipped.sort_by(|a, b| a.path.cmp(&b.path));

    let media = found
        .into_iter()
        .enumerate()
        .map(|(order, (_, path, kind, size))| {
            let mut file = MediaFile::new(path, kind, order);
            file.size = size;
            file
        })
        .collect();
    Ok(ScanResult { media, skipped })
}

/// Scan a folder and fill in capture timestamps on `pool`.
pub fn scan_folder(
    folder: &Path,
    use_filesystem_time: bool,
    pool: &rayon::ThreadPool,
    progress: &ThrottledProgress,
    cancel: Option<&CancellationToken>,
) -> Result<ScanResult> {
    let mut scan = list_folder(folder)?;
    let total = scan.media.len() as u64;
    let done = AtomicU64::new(0);
    log::info!(
        "Found {} media files in {} ({} skipped)",
        total,
        folder.display(),
        scan.skipped.len()
    );

    let dates: Vec<Option<date::DateResult>> = pool.install(|| {
        scan.media
            .par_iter()
            .map(|file| {
                if is_cancelled(cancel) {
                    return None;
                }
                let result = date::extract_date(&file.path, file.kind, use_filesystem_time);
                let n = done.fetch_add(1, Ordering::Relaxed);
                progress.report("scan", n, total, &file.filename);
                result
            })
            .collect()
    });
    if is_cancelled(cancel) {
        return Err(Error::Cancelled);
    }

    for (file, date) in scan.media.iter_mut().zip(dates) {
        if let Some(d) = date {
            file.capture_timestamp = Some(d.date);
            file.time_source = d.source;
        }
    }
    progress.report("scan", total, total, "Scanned");
    Ok(scan)
}
