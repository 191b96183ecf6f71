use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::EngineState;
use crate::error::{Error, Result};
use crate::media::MediaFile;
use crate::strategy::Strategy;

/// One subject: an anchor photo and the videos recorded for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchGroup {
    /// Absent only for video-only groups
    pub anchor: Option<MediaFile>,
    /// Assignment order
    pub videos: Vec<MediaFile>,
    /// Per-video assignment scores, parallel to `videos`
    pub video_scores: Vec<f64>,
    /// Minimum of the per-assignment scores
    pub confidence: f64,
    /// The strategy that produced the group
    pub strategy: Strategy,
    /// Normalized subject name read from the anchor photo
    pub extracted_name: Option<String>,
    /// Second caption line, kept verbatim
    pub extracted_date_text: Option<String>,
    /// Why naming fell back to a simpler template
    pub naming_note: Option<String>,
}

impl MatchGroup {
    pub fn files(&self) -> impl Iterator<Item = &MediaFile> + '_ {
        self.anchor.iter().chain(self.videos.iter())
    }

    pub fn len(&self) -> usize {
        self.anchor.iter().count() + self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture time the group is dated by: the anchor's, else the first video's.
    pub fn capture_timestamp(&self) -> Option<chrono::NaiveDateTime> {
        self.files().find_map(|f| f.capture_timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum DemotionCause {
    /// A video scored equally against two equally close photos
    Ambiguous { video: PathBuf },
    LowConfidence { confidence: f64 },
}

impl fmt::Display for DemotionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DemotionCause::Ambiguous { video } => {
                let name = video.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                write!(f, "ambiguous match for {name}")
            }
            DemotionCause::LowConfidence { confidence } => write!(f, "low confidence {confidence:.2}"),
        }
    }
}

/// A group withheld from the confident output and sent to review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemotedGroup {
    pub group: MatchGroup,
    pub cause: DemotionCause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Video with no unresolved photo before it
    NoPrecedingPhoto,
    NoTimestamp,
    /// Photo that no video was assigned to
    NoMatchedVideo,
    /// Video with no unresolved photo inside the candidate window
    NoCandidatePhoto,
    BelowThreshold { best: f64 },
    FrameSampleFailed { detail: String },
    PhotoUnreadable { detail: String },
    /// Member of the `group`-th demoted group
    Demoted { group: usize, cause: DemotionCause },
    Cancelled,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::NoPrecedingPhoto => f.write_str("no photo before this video"),
            UnresolvedReason::NoTimestamp => f.write_str("no capture timestamp"),
            UnresolvedReason::NoMatchedVideo => f.write_str("no video matched this photo"),
            UnresolvedReason::NoCandidatePhoto => f.write_str("no candidate photo nearby"),
            UnresolvedReason::BelowThreshold { best } => write!(f, "best similarity {best:.2} below threshold"),
            UnresolvedReason::FrameSampleFailed { detail } => write!(f, "frame sampling failed: {detail}"),
            UnresolvedReason::PhotoUnreadable { detail } => write!(f, "photo unreadable: {detail}"),
            UnresolvedReason::Demoted { group, cause } => write!(f, "review group {}: {cause}", group + 1),
            UnresolvedReason::Cancelled => f.write_str("run cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedFile {
    pub file: MediaFile,
    pub reason: UnresolvedReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Neither a photo nor a video
    Unsupported { mime: Option<String> },
    Unreadable { detail: String },
}

/// A folder entry excluded before matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Result of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPlan {
    /// Confident groups in primary order
    pub groups: Vec<MatchGroup>,
    pub unresolved: Vec<UnresolvedFile>,
    pub demoted: Vec<DemotedGroup>,
    pub skipped: Vec<SkippedFile>,
    pub warnings: Vec<String>,
    pub state: EngineState,
    /// Only a complete plan may be written
    pub complete: bool,
}

impl MatchPlan {
    pub fn empty(state: EngineState) -> Self {
        Self {
            groups: Vec::new(),
            unresolved: Vec::new(),
            demoted: Vec::new(),
            skipped: Vec::new(),
            warnings: Vec::new(),
            state,
            complete: false,
        }
    }

    pub fn video_count(&self) -> usize {
        self.groups.iter().map(|g| g.videos.len()).sum()
    }

    /// Check that `files` is partitioned between confident groups and the
    /// unresolved list. Demoted groups only mirror unresolved entries.
    pub fn check_partition(&self, files: &[MediaFile]) -> Result<()> {
        let mut seen: HashMap<&PathBuf, usize> = HashMap::with_capacity(files.len());
        for group in &self.groups {
            if group.is_empty() {
                return Err(Error::InvariantViolation("empty group in plan".into()));
            }
            if group.anchor.as_ref().is_some_and(|a| !a.is_photo()) {
                return Err(Error::InvariantViolation("group anchor is not a photo".into()));
            }
            if group.videos.iter().any(|v| !v.is_video()) {
                return Err(Error::InvariantViolation("photo assigned as a group video".into()));
            }
            for file in group.files() {
                *seen.entry(&file.path).or_default() += 1;
            }
        }
        for entry in &self.unresolved {
            *seen.entry(&entry.file.path).or_default() += 1;
        }

        for file in files {
            match seen.remove(&file.path) {
                Some(1) => {}
                Some(n) => {
                    return Err(Error::InvariantViolation(format!(
                        "{} appears {n} times in the plan",
                        file.path.display()
                    )))
                }
                None => {
                    return Err(Error::InvariantViolation(format!(
                        "{} is neither grouped nor unresolved",
                        file.path.display()
                    )))
                }
            }
        }
        if let Some(path) = seen.keys().next() {
            return Err(Error::InvariantViolation(format!(
                "{} is in the plan but was never scanned",
                path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    fn media(name: &str, order: usize) -> MediaFile {
        let path = PathBuf::from(format!("/in/{name}"));
        let kind = MediaKind::from_path(&path).unwrap();
        MediaFile::new(path, kind, order)
    }

    fn group(anchor: MediaFile, videos: Vec<MediaFile>) -> MatchGroup {
        MatchGroup {
            video_scores: vec![1.0; videos.len()],
            anchor: Some(anchor),
            videos,
            confidence: 1.0,
            strategy: Strategy::Timestamp,
            extracted_name: None,
            extracted_date_text: None,
            naming_note: None,
        }
    }

    #[test]
    fn test_partition_accepts_complete_plan() {
        let files = vec![media("a.jpg", 0), media("b.mp4", 1), media("c.mp4", 2)];
        let mut plan = MatchPlan::empty(EngineState::Done);
        plan.groups.push(group(files[0].clone(), vec![files[1].clone()]));
        plan.unresolved.push(UnresolvedFile {
            file: files[2].clone(),
            reason: UnresolvedReason::NoTimestamp,
        });
        assert!(plan.check_partition(&files).is_ok());
        assert_eq!(plan.video_count(), 1);
    }

    #[test]
    fn test_partition_rejects_duplicates_and_gaps() {
        let files = vec![media("a.jpg", 0), media("b.mp4", 1)];
        let mut plan = MatchPlan::empty(EngineState::Done);
        plan.groups.push(group(files[0].clone(), vec![]));
        assert!(matches!(plan.check_partition(&files), Err(Error::InvariantViolation(_))));

        plan.groups.push(group(files[0].clone(), vec![files[1].clone()]));
        assert!(plan.check_partition(&files).is_err());
    }

    #[test]
    fn test_partition_rejects_photo_as_video() {
        let files = vec![media("a.jpg", 0), media("b.jpg", 1)];
        let mut plan = MatchPlan::empty(EngineState::Done);
        plan.groups.push(group(files[0].clone(), vec![files[1].clone()]));
        assert!(plan.check_partition(&files).is_err());
    }

    #[test]
    fn test_reason_display() {
        let reason = UnresolvedReason::Demoted {
            group: 0,
            cause: DemotionCause::LowConfidence { confidence: 0.4 },
        };
        assert_eq!(reason.to_string(), "review group 1: low confidence 0.40");
    }
}
