use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The input folder itself cannot be listed. Fatal for the whole batch.
    #[error("cannot read media folder {path}: {source}")]
    UnreadableMedia {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Recoverable: the group falls back to sequence naming.
    #[error("OCR result for {path} rejected: {detail}")]
    OcrLowConfidence { path: PathBuf, detail: String },
    /// Recoverable: the group is demoted for manual review.
    #[error("ambiguous match: {video} scores equally against {anchor} and another photo")]
    AmbiguousMatch { anchor: PathBuf, video: PathBuf },
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("match plan did not reach the Done state; refusing to write output")]
    PlanIncomplete,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{tool} failed: {detail}")]
    Tool { tool: &'static str, detail: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("EXIF error: {0}")]
    Exif(#[from] exif::Error),
    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    pub(crate) fn tool(tool: &'static str, detail: impl Into<String>) -> Self {
        Error::Tool {
            tool,
            detail: detail.into(),
        }
    }
}
