//! Compact visual fingerprints for photo/frame comparison.
//!
//! A fingerprint is an 8x8 average hash plus a 64-bin luma histogram. The
//! hash catches layout, the histogram catches exposure and lighting; the
//! similarity score weighs both equally.

use std::path::Path;

use image::{DynamicImage, GrayImage};

use crate::error::Result;

const HISTOGRAM_BINS: usize = 64;

/// Larger inputs are downscaled before hashing.
const MAX_SIDE: u32 = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub hash: u64,
    /// Normalized to sum to 1
    pub histogram: [f64; HISTOGRAM_BINS],
}

impl Fingerprint {
    pub fn from_image(img: &DynamicImage) -> Self {
        let gray = if img.width() > MAX_SIDE || img.height() > MAX_SIDE {
            img.thumbnail(MAX_SIDE, MAX_SIDE).to_luma8()
        } else {
            img.to_luma8()
        };
        Self::from_luma(&gray)
    }

    pub fn from_luma(gray: &GrayImage) -> Self {
        Self {
            hash: average_hash(gray),
            histogram: luma_histogram(gray),
        }
    }

    /// Fingerprint of a photo on disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let img = image::open(path)?;
        Ok(Self::from_image(&img))
    }

    /// Similarity in 0.0..=1.0; identical images score 1.0.
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        let hash_sim = 1.0 - f64::from(hamming_distance(self.hash, other.hash)) / 64.0;
        let hist_sim: f64 = self
            .histogram
            .iter()
            .zip(other.histogram.iter())
            .map(|(a, b)| a.min(*b))
            .sum();
        (0.5 * hash_sim + 0.5 * hist_sim).clamp(0.0, 1.0)
    }
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Downsample to 8x8 block means; bit set where a block is brighter than
/// the mean of all blocks.
fn average_hash(gray: &GrayImage) -> u64 {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    if w == 0 || h == 0 {
        return 0;
    }

    let mut samples = [0u64; 64];
    for by in 0..8 {
        let y_start = by * h / 8;
        let y_end = ((by + 1) * h / 8).max(y_start + 1).min(h);
        for bx in 0..8 {
            let x_start = bx * w / 8;
            let x_end = ((bx + 1) * w / 8).max(x_start + 1).min(w);

            let mut block_sum = 0u64;
            let mut count = 0u64;
            for py in y_start..y_end {
                for px in x_start..x_end {
                    block_sum += u64::from(gray.get_pixel(px as u32, py as u32)[0]);
                    count += 1;
                }
            }
            samples[by * 8 + bx] = if count > 0 { block_sum / count } else { 0 };
        }
    }

    let mean = samples.iter().sum::<u64>() / 64;
    samples
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > mean)
        .fold(0u64, |hash, (i, _)| hash | (1 << i))
}

fn luma_histogram(gray: &GrayImage) -> [f64; HISTOGRAM_BINS] {
    let mut counts = [0u64; HISTOGRAM_BINS];
    for pixel in gray.pixels() {
        counts[usize::from(pixel[0]) * HISTOGRAM_BINS / 256] += 1;
    }
    let total = counts.iter().sum::<u64>().max(1) as f64;
    let mut histogram = [0.0; HISTOGRAM_BINS];
    for (bin, count) in histogram.iter_mut().zip(counts.iter()) {
        *bin = *count as f64 / total;
    }
    histogram
}
