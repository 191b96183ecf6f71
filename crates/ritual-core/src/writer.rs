use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;

use crate::cancel::{is_cancelled, CancellationToken};
use crate::error::{Error, Result};
use crate::manifest::{plan_digest, Manifest, ManifestEntry, MANIFEST_FILENAME};
use crate::media::MediaKind;
use crate::naming::{OutputAssignment, OutputEntry};
use crate::plan::MatchPlan;
use crate::transcode::{self, CompressionPreset, TranscodeOutcome};
use crate::ThrottledProgress;

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOptions {
    /// Overwrite files already in the output folder
    pub force: bool,
    pub compress: Option<CompressionPreset>,
    /// Parts per video for single-video groups; 1 disables splitting
    pub split_segments: u8,
    pub write_manifest: bool,
    /// Concurrent copy/transcode jobs; 0 means one per core
    pub workers: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            force: false,
            compress: None,
            split_segments: 1,
            write_manifest: true,
            workers: 0,
        }
    }
}

/// Result of the write phase.
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    pub files_written: u64,
    /// Files left alone because a previous run already wrote them
    pub files_skipped: u64,
    pub warnings: Vec<String>,
}

/// Names present in the output folder that a new plan must not reuse.
/// Files recorded in our own manifest are not counted: a rerun may
/// overwrite what it wrote before.
pub fn existing_names(output_dir: &Path) -> HashSet<String> {
    let Ok(entries) = fs::read_dir(output_dir) else {
        return HashSet::new();
    };
    let ours: HashSet<String> = match Manifest::load(output_dir) {
        Ok(Some(manifest)) => manifest.outputs().map(str::to_lowercase).collect(),
        Ok(None) => HashSet::new(),
        Err(e) => {
            log::warn!("ignoring unreadable {}: {}", MANIFEST_FILENAME, e);
            HashSet::new()
        }
    };

    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != MANIFEST_FILENAME && !ours.contains(&name.to_lowercase()))
        .collect()
}

struct Job<'a> {
    entry: &'a OutputEntry,
    split: bool,
}

enum JobOutcome {
    Written(Vec<ManifestEntry>, Option<String>),
    Failed(String),
    Cancelled,
}

fn set_mtime(path: &Path, entry: &OutputEntry) {
    if let Some(dt) = &entry.capture_timestamp {
        if let Some(local) = dt.and_local_timezone(chrono::Local).single() {
            let ft = filetime::FileTime::from_unix_time(local.timestamp(), 0);
            filetime::set_file_mtime(path, ft).ok();
        }
    }
}

fn manifest_entry(entry: &OutputEntry, path: &Path) -> Result<ManifestEntry> {
    let output = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| entry.file_name.clone());
    Ok(ManifestEntry {
        source: entry.source.clone(),
        output,
        size: fs::metadata(path)?.len(),
    })
}

fn write_single(entry: &OutputEntry, dest: &Path, compress: Option<CompressionPreset>) -> Result<Option<String>> {
    let note = match compress {
        Some(preset) => match transcode::compress(&entry.source, dest, entry.kind, preset)? {
            TranscodeOutcome::Compressed => None,
            TranscodeOutcome::Copied(reason) => {
                Some(format!("{}: kept original ({})", entry.file_name, reason))
            }
        },
        None => {
            fs::copy(&entry.source, dest)?;
            None
        }
    };
    Ok(note)
}

fn run_job(job: &Job, output_dir: &Path, options: &WriteOptions) -> Result<(Vec<ManifestEntry>, Option<String>)> {
    let entry = job.entry;
    let dest = output_dir.join(&entry.file_name);

    if job.split {
        let name = Path::new(&entry.file_name);
        let base = name.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let ext = name.extension().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        match transcode::split_video(&entry.source, output_dir, &base, &ext, options.split_segments, options.compress) {
            Ok(parts) if parts.len() == usize::from(options.split_segments) => {
                let mut written = Vec::with_capacity(parts.len());
                for part in &parts {
                    set_mtime(part, entry);
                    written.push(manifest_entry(entry, part)?);
                }
                return Ok((written, None));
            }
            Ok(parts) => {
                // Incomplete split; keep the whole video instead
                for part in &parts {
                    fs::remove_file(part).ok();
                }
                let note = format!(
                    "{}: only {} of {} parts written, kept unsplit",
                    entry.file_name,
                    parts.len(),
                    options.split_segments
                );
                write_single(entry, &dest, options.compress)?;
                set_mtime(&dest, entry);
                return Ok((vec![manifest_entry(entry, &dest)?], Some(note)));
            }
            Err(e) => {
                let note = format!("{}: not split ({})", entry.file_name, e);
                write_single(entry, &dest, options.compress)?;
                set_mtime(&dest, entry);
                return Ok((vec![manifest_entry(entry, &dest)?], Some(note)));
            }
        }
    }

    let note = write_single(entry, &dest, options.compress)?;
    set_mtime(&dest, entry);
    Ok((vec![manifest_entry(entry, &dest)?], note))
}

/// Copy (or compress, or split) every assigned file into `output_dir`.
///
/// Refuses incomplete plans. A single failed file becomes a warning; the
/// rest of the plan is still written.
pub fn write_output(
    plan: &MatchPlan,
    assignment: &OutputAssignment,
    output_dir: &Path,
    options: &WriteOptions,
    progress: &ThrottledProgress,
    cancel: Option<&CancellationToken>,
) -> Result<WriteResult> {
    if !plan.complete {
        return Err(Error::PlanIncomplete);
    }
    fs::create_dir_all(output_dir)?;

    let digest = plan_digest(assignment, options.compress, options.split_segments);
    if options.write_manifest && !options.force {
        if let Ok(Some(manifest)) = Manifest::load(output_dir) {
            if manifest.is_applied(output_dir, &digest) {
                log::info!("{} already matches this plan, nothing to write", output_dir.display());
                return Ok(WriteResult {
                    files_written: 0,
                    files_skipped: manifest.entries.len() as u64,
                    warnings: Vec::new(),
                });
            }
        }
    }

    let split = options.split_segments > 1;
    let jobs: Vec<Job> = assignment
        .entries
        .iter()
        .map(|entry| Job {
            entry,
            split: split
                && entry.kind == MediaKind::Video
                && plan.groups.get(entry.group_index).map(|g| g.videos.len()) == Some(1),
        })
        .collect();

    let mut builder = rayon::ThreadPoolBuilder::new();
    if options.workers > 0 {
        builder = builder.num_threads(options.workers);
    }
    let pool = builder.build()?;

    let total = jobs.len() as u64;
    let counter = AtomicU64::new(0);
    let outcomes: Vec<JobOutcome> = pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                if is_cancelled(cancel) {
                    return JobOutcome::Cancelled;
                }
                let outcome = match run_job(job, output_dir, options) {
                    Ok((entries, note)) => JobOutcome::Written(entries, note),
                    Err(e) => {
                        log::warn!("failed to write {}: {}", job.entry.file_name, e);
                        JobOutcome::Failed(format!("{}: {}", job.entry.source.display(), e))
                    }
                };
                let current = counter.fetch_add(1, Ordering::Relaxed);
                progress.report("write", current, total, &job.entry.file_name);
                outcome
            })
            .collect()
    });

    let mut result = WriteResult::default();
    let mut written: Vec<ManifestEntry> = Vec::new();
    let mut cancelled = false;
    let mut failed = false;
    for outcome in outcomes {
        match outcome {
            JobOutcome::Written(entries, note) => {
                result.files_written += entries.len() as u64;
                written.extend(entries);
                result.warnings.extend(note);
            }
            JobOutcome::Failed(warning) => {
                failed = true;
                result.warnings.push(warning);
            }
            JobOutcome::Cancelled => cancelled = true,
        }
    }

    if options.write_manifest {
        // A partial write is recorded without a digest so the next run redoes it
        let digest = if cancelled || failed { String::new() } else { digest };
        log::debug!("recording {} outputs in {}", written.len(), MANIFEST_FILENAME);
        Manifest::new(digest, plan.groups.len(), written).save(output_dir)?;
    }

    if cancelled {
        return Err(Error::Cancelled);
    }
    progress.report("write", total, total, "Written");
    Ok(result)
}
