use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::strategy::Strategy;

/// Fraction of the photo, anchored at the bottom-left corner, handed to OCR.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OcrRegion {
    pub width_fraction: f32,
    pub height_fraction: f32,
}

impl Default for OcrRegion {
    fn default() -> Self {
        Self {
            width_fraction: 0.5,
            height_fraction: 0.35,
        }
    }
}

/// Everything the matching engine reads from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub strategy: Strategy,
    /// Fall through to lower-priority strategies for leftover files
    pub cascade: bool,
    pub similarity_threshold: f64,
    /// Scores closer than this are considered tied
    pub tie_epsilon: f64,
    /// How many timeline positions around a video are searched for its photo
    pub candidate_window: usize,
    /// Relative positions (0.0..=1.0) of the frames sampled from each video
    pub frame_positions: Vec<f64>,
    /// Groups below this confidence are demoted for review
    pub confidence_floor: f64,
    pub ocr_confidence_threshold: f32,
    pub ocr_region: OcrRegion,
    /// Try the whole photo when the corner region yields nothing usable
    pub ocr_full_image_fallback: bool,
    pub use_filesystem_time: bool,
    /// Size of the worker pool for external tools (0 = one per core)
    pub workers: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Timestamp,
            cascade: true,
            similarity_threshold: 0.80,
            tie_epsilon: 0.01,
            candidate_window: 4,
            frame_positions: vec![0.1, 0.5],
            confidence_floor: 0.5,
            ocr_confidence_threshold: 0.6,
            ocr_region: OcrRegion::default(),
            ocr_full_image_fallback: true,
            use_filesystem_time: true,
            workers: 0,
        }
    }
}

impl MatchConfig {
    /// Load from a JSON file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: MatchConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!("{name} must be within 0..=1, got {v}")))
            }
        };
        unit("similarity_threshold", self.similarity_threshold)?;
        unit("tie_epsilon", self.tie_epsilon)?;
        unit("confidence_floor", self.confidence_floor)?;
        unit("ocr_confidence_threshold", f64::from(self.ocr_confidence_threshold))?;
        unit("ocr_region.width_fraction", f64::from(self.ocr_region.width_fraction))?;
        unit("ocr_region.height_fraction", f64::from(self.ocr_region.height_fraction))?;
        if self.ocr_region.width_fraction == 0.0 || self.ocr_region.height_fraction == 0.0 {
            return Err(Error::InvalidConfig("ocr_region must not be empty".into()));
        }
        if self.candidate_window == 0 {
            return Err(Error::InvalidConfig("candidate_window must be at least 1".into()));
        }
        if self.frame_positions.is_empty() {
            return Err(Error::InvalidConfig("frame_positions must not be empty".into()));
        }
        for &p in &self.frame_positions {
            unit("frame_positions", p)?;
        }
        Ok(())
    }
}
