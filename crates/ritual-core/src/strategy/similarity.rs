//! Visual matching of videos to photos.
//!
//! Every unresolved video is compared with the unresolved photos within
//! `candidate_window` positions of it on the capture timeline. A video joins
//! the best-scoring photo if the score clears `similarity_threshold`; the
//! decision never depends on the threshold otherwise, so raising it can only
//! drop assignments.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use crate::cache::FingerprintEntry;
use crate::cancel::is_cancelled;
use crate::fingerprint::Fingerprint;
use crate::media::MediaFile;
use crate::plan::UnresolvedReason;

use super::timeline::timeline_order;
use super::{DraftGroup, MatchContext, ResolvedSet, Strategy, StrategyOutcome};

/// A photo considered for one video.
#[derive(Debug, Clone, Copy)]
struct Scored {
    photo: usize,
    score: f64,
    /// Timeline distance to the video
    distance: usize,
    /// Timeline position of the photo
    position: usize,
}

pub fn match_by_similarity(files: &[MediaFile], resolved: &ResolvedSet, ctx: &MatchContext<'_>) -> StrategyOutcome {
    let mut outcome = StrategyOutcome::default();
    let order = timeline_order(files);
    let mut position = vec![0usize; files.len()];
    for (pos, &i) in order.iter().enumerate() {
        position[i] = pos;
    }

    let open: Vec<usize> = order.iter().copied().filter(|&i| !resolved.contains(i)).collect();
    let window = ctx.config.candidate_window;

    // Candidate photos per video, in timeline order
    let candidates: Vec<(usize, Vec<usize>)> = open
        .iter()
        .filter(|&&v| files[v].is_video())
        .map(|&v| {
            let photos = open
                .iter()
                .copied()
                .filter(|&p| files[p].is_photo() && position[p].abs_diff(position[v]) <= window)
                .collect();
            (v, photos)
        })
        .collect();

    let work: BTreeSet<usize> = candidates
        .iter()
        .filter(|(_, photos)| !photos.is_empty())
        .flat_map(|(v, photos)| std::iter::once(*v).chain(photos.iter().copied()))
        .collect();
    let work: Vec<usize> = work.into_iter().collect();

    log::info!("Fingerprinting {} files for similarity matching", work.len());
    ctx.pool.install(|| {
        work.par_iter().for_each(|&i| {
            if is_cancelled(ctx.cancel) {
                return;
            }
            let _ = ctx.cache.fingerprints(i, || compute_fingerprints(&files[i], ctx));
        });
    });
    if is_cancelled(ctx.cancel) {
        outcome.cancelled = true;
        return outcome;
    }

    let fingerprints = |i: usize| ctx.cache.cached_fingerprints(i);

    let mut warned_photos = BTreeSet::new();
    let mut assignments: BTreeMap<usize, DraftGroup> = BTreeMap::new();

    for (video, photos) in &candidates {
        let video = *video;
        if photos.is_empty() {
            outcome.unresolved.push((video, UnresolvedReason::NoCandidatePhoto));
            continue;
        }
        let frames = match fingerprints(video) {
            Some(Ok(frames)) if !frames.is_empty() => frames,
            Some(Ok(_)) => {
                outcome.unresolved.push((
                    video,
                    UnresolvedReason::FrameSampleFailed {
                        detail: "no frames decoded".into(),
                    },
                ));
                continue;
            }
            Some(Err(e)) => {
                outcome.warnings.push(format!("{}: {e}", files[video].filename));
                outcome.unresolved.push((video, UnresolvedReason::FrameSampleFailed { detail: e.clone() }));
                continue;
            }
            None => {
                outcome.unresolved.push((
                    video,
                    UnresolvedReason::FrameSampleFailed {
                        detail: "not sampled".into(),
                    },
                ));
                continue;
            }
        };

        let mut scored = Vec::with_capacity(photos.len());
        for &photo in photos {
            let photo_fp = match fingerprints(photo) {
                Some(Ok(fps)) => match fps.first() {
                    Some(fp) => fp,
                    None => continue,
                },
                Some(Err(e)) => {
                    if warned_photos.insert(photo) {
                        outcome.warnings.push(format!("{}: {e}", files[photo].filename));
                    }
                    continue;
                }
                None => continue,
            };
            scored.push(Scored {
                photo,
                score: best_frame_score(photo_fp, frames),
                distance: position[photo].abs_diff(position[video]),
                position: position[photo],
            });
        }

        match choose(&scored, ctx.config.similarity_threshold, ctx.config.tie_epsilon) {
            Choice::Assigned { pick, ambiguous } => {
                log::debug!(
                    "{} -> {} (score {:.3}{})",
                    files[video].filename,
                    files[pick.photo].filename,
                    pick.score,
                    if ambiguous { ", ambiguous" } else { "" }
                );
                let group = assignments
                    .entry(position[pick.photo])
                    .or_insert_with(|| DraftGroup::anchored(pick.photo, 1.0, Strategy::Similarity));
                group.push(video, pick.score);
                if ambiguous && group.ambiguous_video.is_none() {
                    group.ambiguous_video = Some(video);
                }
            }
            Choice::Below { best } => {
                outcome.unresolved.push((video, UnresolvedReason::BelowThreshold { best }));
            }
            Choice::NoScores => {
                outcome.unresolved.push((
                    video,
                    UnresolvedReason::PhotoUnreadable {
                        detail: "no candidate photo could be fingerprinted".into(),
                    },
                ));
            }
        }
    }

    // Photos that attracted no video stay open for later strategies
    let grouped: BTreeSet<usize> = assignments.values().filter_map(|g| g.anchor).collect();
    for &i in &open {
        if !files[i].is_photo() || grouped.contains(&i) {
            continue;
        }
        let reason = match ctx.cache.cached_fingerprints(i) {
            Some(Err(e)) => UnresolvedReason::PhotoUnreadable { detail: e.clone() },
            _ => UnresolvedReason::NoMatchedVideo,
        };
        outcome.unresolved.push((i, reason));
    }

    outcome.groups = assignments.into_values().collect();
    outcome
}

fn compute_fingerprints(file: &MediaFile, ctx: &MatchContext<'_>) -> FingerprintEntry {
    if file.is_photo() {
        return Fingerprint::from_path(&file.path)
            .map(|fp| vec![fp])
            .map_err(|e| e.to_string());
    }
    ctx.sampler
        .sample_frames(&file.path, &ctx.config.frame_positions)
        .map(|frames| frames.iter().map(Fingerprint::from_image).collect())
        .map_err(|e| e.to_string())
}

/// Best match over all sampled frames.
fn best_frame_score(photo: &Fingerprint, frames: &[Fingerprint]) -> f64 {
    frames.iter().map(|f| photo.similarity(f)).fold(0.0, f64::max)
}

#[derive(Debug)]
enum Choice {
    Assigned { pick: Scored, ambiguous: bool },
    Below { best: f64 },
    NoScores,
}

/// Pick the photo for one video. Scores within `epsilon` of the best are
/// tied; ties go to the closest photo, then to the earliest one, in which
/// case the assignment is flagged ambiguous.
fn choose(scored: &[Scored], threshold: f64, epsilon: f64) -> Choice {
    let Some(best) = scored.iter().map(|s| s.score).reduce(f64::max) else {
        return Choice::NoScores;
    };
    if best < threshold {
        return Choice::Below { best };
    }

    let tied: Vec<&Scored> = scored.iter().filter(|s| s.score >= best - epsilon).collect();
    let closest = tied.iter().map(|s| s.distance).min().unwrap_or(0);
    let mut nearest: Vec<&Scored> = tied.into_iter().filter(|s| s.distance == closest).collect();
    nearest.sort_by_key(|s| s.position);

    match nearest.as_slice() {
        [] => Choice::NoScores,
        [only] => Choice::Assigned {
            pick: **only,
            ambiguous: false,
        },
        [first, ..] => Choice::Assigned {
            pick: **first,
            ambiguous: true,
        },
    }
}
