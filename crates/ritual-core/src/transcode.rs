//! Optional post-pass applied to already-named output files: size reduction
//! and splitting long videos. Neither ever changes which files are written or
//! what they are called, except that a split video becomes lettered parts.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command;

use clap::ValueEnum;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::date::video::probe_duration;
use crate::error::{Error, Result};
use crate::media::MediaKind;
use crate::naming::suffix_letters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionPreset {
    /// Larger files, barely visible loss
    High,
    Balanced,
    /// Smallest files, slight quality loss
    Small,
}

impl CompressionPreset {
    pub fn image_quality(self) -> u8 {
        match self {
            CompressionPreset::High => 85,
            CompressionPreset::Balanced => 75,
            CompressionPreset::Small => 60,
        }
    }

    pub fn video_crf(self) -> u8 {
        match self {
            CompressionPreset::High => 23,
            CompressionPreset::Balanced => 28,
            CompressionPreset::Small => 32,
        }
    }
}

/// CRF used when splitting without compression.
const SPLIT_CRF: u8 = 18;

pub const MIN_SEGMENTS: u8 = 2;
pub const MAX_SEGMENTS: u8 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOutcome {
    Compressed,
    /// Plain copy; the reason compression was not used
    Copied(String),
}

/// Write `source` to `dest`, compressed where possible, else copied.
pub fn compress(source: &Path, dest: &Path, kind: MediaKind, preset: CompressionPreset) -> Result<TranscodeOutcome> {
    let attempt = match kind {
        MediaKind::Photo => compress_image(source, dest, preset.image_quality()),
        MediaKind::Video => compress_video(source, dest, preset.video_crf()),
    };
    let reason = match attempt {
        Ok(()) => {
            let (before, after) = (fs::metadata(source)?.len(), fs::metadata(dest)?.len());
            if after < before {
                return Ok(TranscodeOutcome::Compressed);
            }
            format!("re-encoded size {after} is not smaller than {before}")
        }
        Err(e) => e.to_string(),
    };
    log::debug!("{}: copying instead ({reason})", source.display());
    fs::copy(source, dest)?;
    Ok(TranscodeOutcome::Copied(reason))
}

fn compress_image(source: &Path, dest: &Path, quality: u8) -> Result<()> {
    let ext = dest
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let img = image::open(source)?;
    let (w, h) = (img.width(), img.height());
    let mut out = BufWriter::new(File::create(dest)?);
    match ext.as_str() {
        "jpg" | "jpeg" => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, quality).encode(&rgb, w, h, ColorType::Rgb8)?;
        }
        "png" => {
            let rgba = img.to_rgba8();
            PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive).write_image(
                &rgba,
                w,
                h,
                ColorType::Rgba8,
            )?;
        }
        other => {
            return Err(Error::tool("image", format!("cannot re-encode .{other}")));
        }
    }
    Ok(())
}

fn run_ffmpeg(args: &[&str], input: &Path, tail: &[&str], output: &Path) -> Result<()> {
    let result = Command::new("ffmpeg")
        .args(["-y", "-v", "error"])
        .args(args)
        .arg("-i")
        .arg(input)
        .args(tail)
        .arg(output)
        .output()
        .map_err(|e| Error::tool("ffmpeg", e.to_string()))?;
    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(Error::tool("ffmpeg", stderr.trim().to_string()));
    }
    Ok(())
}

fn compress_video(source: &Path, dest: &Path, crf: u8) -> Result<()> {
    let crf = crf.to_string();
    run_ffmpeg(
        &[],
        source,
        &[
            "-c:v", "libx264", "-crf", &crf, "-preset", "medium", "-c:a", "aac", "-b:a", "128k", "-movflags",
            "+faststart",
        ],
        dest,
    )
}

/// Split `source` into `segments` equal parts named `<base>a.<ext>`,
/// `<base>b.<ext>`, ... in `dir`. Returns the parts that were written; a
/// failed part is logged and left out.
pub fn split_video(
    source: &Path,
    dir: &Path,
    base: &str,
    ext: &str,
    segments: u8,
    preset: Option<CompressionPreset>,
) -> Result<Vec<PathBuf>> {
    if !(MIN_SEGMENTS..=MAX_SEGMENTS).contains(&segments) {
        return Err(Error::InvalidConfig(format!(
            "split segments must be within {MIN_SEGMENTS}..={MAX_SEGMENTS}, got {segments}"
        )));
    }
    let duration = probe_duration(source)?;
    let part = duration / f64::from(segments);
    let (crf, encode_preset, audio_rate) = match preset {
        Some(p) => (p.video_crf(), "medium", "128k"),
        None => (SPLIT_CRF, "fast", "192k"),
    };
    let crf = crf.to_string();
    let length = format!("{part:.3}");

    let mut written = Vec::with_capacity(usize::from(segments));
    for i in 0..segments {
        let start = format!("{:.3}", part * f64::from(i));
        let name = if ext.is_empty() {
            format!("{base}{}", suffix_letters(usize::from(i)))
        } else {
            format!("{base}{}.{ext}", suffix_letters(usize::from(i)))
        };
        let out = dir.join(&name);
        let result = run_ffmpeg(
            &["-ss", &start],
            source,
            &[
                "-t", &length, "-c:v", "libx264", "-crf", &crf, "-preset", encode_preset, "-c:a", "aac", "-b:a",
                audio_rate, "-movflags", "+faststart",
            ],
            &out,
        );
        match result {
            Ok(()) => {
                log::info!("wrote segment {name}");
                written.push(out);
            }
            Err(e) => log::warn!("segment {name} of {} failed: {e}", source.display()),
        }
    }
    Ok(written)
}
