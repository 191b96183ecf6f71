//! Timestamp and sequential matching.
//!
//! Both walk the files in one total order and let every unresolved photo
//! open a group that collects the videos following it. They differ only in
//! the order and in how much they trust each assignment.

use crate::media::{MediaFile, TimeSource};
use crate::plan::UnresolvedReason;

use super::{DraftGroup, ResolvedSet, Strategy, StrategyOutcome};

/// Score of an assignment made purely by filename order.
pub const SEQUENTIAL_SCORE: f64 = 0.6;

/// How much a timestamp-ordered assignment is trusted, by timestamp origin.
pub fn time_source_score(source: TimeSource) -> f64 {
    match source {
        TimeSource::Exif | TimeSource::VideoMetadata => 1.0,
        TimeSource::Filename => 0.9,
        TimeSource::Filesystem => 0.75,
        TimeSource::None => 0.5,
    }
}

/// File indices sorted by capture time. Files without a timestamp go last;
/// equal timestamps keep filename order.
pub fn timeline_order(files: &[MediaFile]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..files.len()).collect();
    order.sort_by_key(|&i| {
        let f = &files[i];
        (f.capture_timestamp.is_none(), f.capture_timestamp, f.filename_order)
    });
    order
}

/// File indices in filename order.
pub fn filename_order(files: &[MediaFile]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..files.len()).collect();
    order.sort_by_key(|&i| files[i].filename_order);
    order
}

/// Group along the timeline. Untimed files sit after every timed one, so a
/// trailing untimed video still joins the last photo before it. With no
/// timestamp anywhere there is no timeline, and the files are left for the
/// next strategy.
pub fn match_by_timestamp(files: &[MediaFile], resolved: &ResolvedSet) -> StrategyOutcome {
    if files.iter().all(|f| f.capture_timestamp.is_none()) {
        return StrategyOutcome {
            unresolved: (0..files.len())
                .filter(|&i| !resolved.contains(i))
                .map(|i| (i, UnresolvedReason::NoTimestamp))
                .collect(),
            ..StrategyOutcome::default()
        };
    }
    let order = timeline_order(files);
    group_in_order(files, &order, resolved, Strategy::Timestamp, |f| {
        time_source_score(f.time_source)
    })
}

pub fn match_sequential(files: &[MediaFile], resolved: &ResolvedSet) -> StrategyOutcome {
    let order = filename_order(files);
    group_in_order(files, &order, resolved, Strategy::Sequential, |_| SEQUENTIAL_SCORE)
}

/// Walk `order`: each unresolved photo closes the open group and opens a new
/// one; unresolved videos join the open group. An already-resolved photo
/// only closes the open group, since it marks another subject.
fn group_in_order(
    files: &[MediaFile],
    order: &[usize],
    resolved: &ResolvedSet,
    strategy: Strategy,
    score: impl Fn(&MediaFile) -> f64,
) -> StrategyOutcome {
    let mut outcome = StrategyOutcome::default();
    let mut open: Option<DraftGroup> = None;

    for &i in order {
        let file = &files[i];
        if resolved.contains(i) {
            if file.is_photo() {
                outcome.groups.extend(open.take());
            }
            continue;
        }

        if file.is_photo() {
            outcome.groups.extend(open.take());
            open = Some(DraftGroup::anchored(i, score(file), strategy));
        } else if let Some(group) = open.as_mut() {
            group.push(i, score(file));
        } else {
            log::debug!("{}: no photo opens a group before it", file.filename);
            outcome.unresolved.push((i, UnresolvedReason::NoPrecedingPhoto));
        }
    }
    outcome.groups.extend(open);
    outcome
}
