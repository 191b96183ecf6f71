use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::DynamicImage;

use crate::date::video::probe_duration;
use crate::error::{Error, Result};

/// Extracts still frames from a video.
pub trait FrameSampler: Send + Sync {
    /// One decoded frame per relative position (0.0..=1.0 of the duration).
    fn sample_frames(&self, video: &Path, positions: &[f64]) -> Result<Vec<DynamicImage>>;
}

/// Samples frames by shelling out to `ffprobe` and `ffmpeg`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegSampler;

/// Seeking exactly to the end yields no frame.
const END_MARGIN_SECS: f64 = 0.1;

impl FrameSampler for FfmpegSampler {
    fn sample_frames(&self, video: &Path, positions: &[f64]) -> Result<Vec<DynamicImage>> {
        let duration = probe_duration(video)?;
        let last = (duration - END_MARGIN_SECS).max(0.0);
        positions
            .iter()
            .map(|p| extract_frame_at(video, (duration * p.clamp(0.0, 1.0)).min(last)))
            .collect()
    }
}

fn extract_frame_at(video: &Path, seconds: f64) -> Result<DynamicImage> {
    let output = Command::new("ffmpeg")
        .args(["-v", "error", "-ss", &format!("{seconds:.3}"), "-i"])
        .arg(video)
        .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"])
        .output()
        .map_err(|e| Error::tool("ffmpeg", e.to_string()))?;
    if !output.status.success() || output.stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::tool(
            "ffmpeg",
            format!("no frame at {seconds:.3}s of {}: {}", video.display(), stderr.trim()),
        ));
    }
    Ok(image::load_from_memory(&output.stdout)?)
}

type SampleFn = Box<dyn Fn(&Path) -> Result<Vec<DynamicImage>> + Send + Sync>;

/// Serves canned frames, for tests and offline dry runs.
pub struct MockFrameSampler {
    sample: SampleFn,
    calls: AtomicUsize,
}

impl MockFrameSampler {
    pub fn with_fn<F>(sample: F) -> Self
    where
        F: Fn(&Path) -> Result<Vec<DynamicImage>> + Send + Sync + 'static,
    {
        Self {
            sample: Box::new(sample),
            calls: AtomicUsize::new(0),
        }
    }

    /// Frames keyed by video path; unknown videos fail to sample.
    pub fn with_frames(frames: HashMap<PathBuf, Vec<DynamicImage>>) -> Self {
        Self::with_fn(move |path| {
            frames
                .get(path)
                .cloned()
                .ok_or_else(|| Error::tool("mock sampler", format!("no frames for {}", path.display())))
        })
    }

    /// How many videos have been sampled so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FrameSampler for MockFrameSampler {
    fn sample_frames(&self, video: &Path, _positions: &[f64]) -> Result<Vec<DynamicImage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.sample)(video)
    }
}
