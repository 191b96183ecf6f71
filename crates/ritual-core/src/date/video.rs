use std::path::Path;
use std::process::Command;

use chrono::{DateTime, Local, NaiveDateTime};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Container tags that may carry the recording time, best first.
const CREATION_TIME_TAGS: &[&str] = &["com.apple.quicktime.creationdate", "creation_time"];

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
}

fn run_ffprobe(path: &Path) -> Result<ProbeOutput> {
    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .output()
        .map_err(|e| Error::tool("ffprobe", e.to_string()))?;
    if !output.status.success() {
        return Err(Error::tool("ffprobe", format!("exit status {}", output.status)));
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

/// Recording time from the container metadata, converted to local time so
/// it sorts consistently with EXIF timestamps.
pub fn probe_creation_time(path: &Path) -> Option<NaiveDateTime> {
    match run_ffprobe(path) {
        Ok(probe) => creation_time_from_tags(&probe.format.tags),
        Err(e) => {
            log::debug!("no container metadata for {}: {}", path.display(), e);
            None
        }
    }
}

/// Duration of a video in seconds.
pub fn probe_duration(path: &Path) -> Result<f64> {
    let probe = run_ffprobe(path)?;
    probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| Error::tool("ffprobe", format!("no duration for {}", path.display())))
}

fn creation_time_from_tags(tags: &std::collections::HashMap<String, String>) -> Option<NaiveDateTime> {
    CREATION_TIME_TAGS
        .iter()
        .filter_map(|key| tags.get(*key))
        .find_map(|value| parse_container_time(value))
}

fn parse_container_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    // 2024-01-31T02:20:30.000000Z
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    // 2024-01-31T10:20:30+0800 (QuickTime)
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    // No zone: taken as local time
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}
