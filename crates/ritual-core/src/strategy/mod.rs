//! Matching strategies.
//!
//! Each strategy is a pure function from the scanned files plus the set of
//! files already resolved by higher-priority strategies to new draft groups
//! and a list of files it could not place. Only the engine turns drafts into
//! plan groups.

pub mod similarity;
pub mod timeline;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::cache::BatchCache;
use crate::cancel::CancellationToken;
use crate::config::MatchConfig;
use crate::frames::FrameSampler;
use crate::media::MediaFile;
use crate::plan::UnresolvedReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Compare photos with sampled video frames
    Similarity,
    /// Capture-time order; each photo opens a group
    Timestamp,
    /// Filename order; each photo opens a group
    Sequential,
}

/// Fixed cascade order, highest priority first.
static CASCADE_ORDER: [Strategy; 3] = [Strategy::Similarity, Strategy::Timestamp, Strategy::Sequential];

impl Strategy {
    /// The strategies an engine configured with `self` runs, in order.
    pub fn chain(self, cascade: bool) -> &'static [Strategy] {
        let start = match self {
            Strategy::Similarity => 0,
            Strategy::Timestamp => 1,
            Strategy::Sequential => 2,
        };
        if cascade {
            &CASCADE_ORDER[start..]
        } else {
            &CASCADE_ORDER[start..=start]
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Similarity => "similarity",
            Strategy::Timestamp => "timestamp",
            Strategy::Sequential => "sequential",
        }
    }

    /// Attempt matching on the files not yet in `resolved`.
    pub fn attempt(self, files: &[MediaFile], resolved: &ResolvedSet, ctx: &MatchContext<'_>) -> StrategyOutcome {
        match self {
            Strategy::Similarity => similarity::match_by_similarity(files, resolved, ctx),
            Strategy::Timestamp => timeline::match_by_timestamp(files, resolved),
            Strategy::Sequential => timeline::match_sequential(files, resolved),
        }
    }
}

/// Collaborators a strategy may use. Timeline strategies ignore all of it.
pub struct MatchContext<'a> {
    pub config: &'a MatchConfig,
    pub sampler: &'a dyn FrameSampler,
    pub cache: &'a BatchCache,
    pub pool: &'a rayon::ThreadPool,
    pub cancel: Option<&'a CancellationToken>,
}

/// Indices (= `filename_order`) of files already placed in a group.
#[derive(Debug, Clone)]
pub struct ResolvedSet {
    resolved: Vec<bool>,
}

impl ResolvedSet {
    pub fn new(len: usize) -> Self {
        Self {
            resolved: vec![false; len],
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.resolved.get(index).copied().unwrap_or(false)
    }

    /// Returns `false` if the index was already resolved.
    pub fn insert(&mut self, index: usize) -> bool {
        match self.resolved.get_mut(index) {
            Some(slot) if !*slot => {
                *slot = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.resolved.iter().all(|r| *r)
    }
}

/// A group as proposed by a strategy, by file index.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftGroup {
    pub anchor: Option<usize>,
    pub anchor_score: f64,
    /// Assignment order
    pub members: Vec<usize>,
    pub member_scores: Vec<f64>,
    /// Set when a member tied between two equally close photos
    pub ambiguous_video: Option<usize>,
    pub strategy: Strategy,
}

impl DraftGroup {
    pub fn anchored(anchor: usize, anchor_score: f64, strategy: Strategy) -> Self {
        Self {
            anchor: Some(anchor),
            anchor_score,
            members: Vec::new(),
            member_scores: Vec::new(),
            ambiguous_video: None,
            strategy,
        }
    }

    pub fn push(&mut self, video: usize, score: f64) {
        self.members.push(video);
        self.member_scores.push(score);
    }

    /// Minimum of the per-assignment scores.
    pub fn confidence(&self) -> f64 {
        let anchor = self.anchor.map(|_| self.anchor_score);
        anchor
            .into_iter()
            .chain(self.member_scores.iter().copied())
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.min(s))))
            .unwrap_or(0.0)
    }

    /// Every file index in the group, anchor first.
    pub fn files(&self) -> impl Iterator<Item = usize> + '_ {
        self.anchor.into_iter().chain(self.members.iter().copied())
    }
}

#[derive(Debug, Default)]
pub struct StrategyOutcome {
    pub groups: Vec<DraftGroup>,
    pub unresolved: Vec<(usize, UnresolvedReason)>,
    pub warnings: Vec<String>,
    /// The run was aborted before any score was acted upon
    pub cancelled: bool,
}
