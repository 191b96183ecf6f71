//! Plain-text summary of a plan, shown before anything is written.

use std::fmt::Write;

use crate::naming::OutputAssignment;
use crate::plan::{MatchPlan, UnresolvedReason};

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Render the confident groups with their output names, then everything
/// that needs a human to look at it.
pub fn render(plan: &MatchPlan, assignment: &OutputAssignment) -> String {
    let mut out = String::new();
    let width = plan.groups.len().to_string().len().max(3);

    for (index, group) in plan.groups.iter().enumerate() {
        let _ = writeln!(
            out,
            "[{:0width$}] confidence {:.2} ({})",
            index + 1,
            group.confidence,
            group.strategy.name()
        );
        for entry in assignment.for_group(index) {
            let _ = writeln!(out, "    {} -> {}", file_name(&entry.source), entry.file_name);
        }
        if let Some(name) = &group.extracted_name {
            let _ = writeln!(out, "    name: {name}");
        }
        if let Some(note) = &group.naming_note {
            let _ = writeln!(out, "    note: {note}");
        }
    }

    let loose: Vec<_> = plan
        .unresolved
        .iter()
        .filter(|u| !matches!(u.reason, UnresolvedReason::Demoted { .. }))
        .collect();
    if !plan.demoted.is_empty() || !loose.is_empty() {
        let _ = writeln!(out, "\nNeeds review:");
        for (index, demoted) in plan.demoted.iter().enumerate() {
            let _ = writeln!(out, "  group {} ({}, {}):", index + 1, demoted.cause, demoted.group.strategy.name());
            for file in demoted.group.files() {
                let _ = writeln!(out, "    {}", file.filename);
            }
        }
        for entry in loose {
            let _ = writeln!(out, "  {}: {}", entry.file.filename, entry.reason);
        }
    }

    if !plan.skipped.is_empty() {
        let _ = writeln!(out, "\nSkipped:");
        for skipped in &plan.skipped {
            let _ = writeln!(out, "  {}", file_name(&skipped.path));
        }
    }

    if !plan.warnings.is_empty() {
        let _ = writeln!(out, "\nWarnings:");
        for warning in &plan.warnings {
            let _ = writeln!(out, "  {warning}");
        }
    }

    let _ = write!(
        out,
        "\n{} groups ({} videos), {} for review, {} unresolved files",
        plan.groups.len(),
        plan.video_count(),
        plan.demoted.len(),
        plan.unresolved.len()
    );
    if !assignment.fallbacks.is_empty() {
        let _ = write!(out, ", {} named by sequence", assignment.fallbacks.len());
    }
    if !plan.complete {
        let _ = write!(out, " [incomplete: {:?}]", plan.state);
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use crate::media::{MediaFile, MediaKind};
    use crate::naming::{format_plan, NamingOptions};
    use crate::plan::{DemotedGroup, DemotionCause, MatchGroup, SkipReason, SkippedFile, UnresolvedFile};
    use crate::strategy::Strategy;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn media(name: &str, order: usize) -> MediaFile {
        let path = PathBuf::from(format!("/in/{name}"));
        let kind = MediaKind::from_path(&path).unwrap();
        MediaFile::new(path, kind, order)
    }

    fn group(anchor: MediaFile, videos: Vec<MediaFile>, confidence: f64) -> MatchGroup {
        MatchGroup {
            anchor: Some(anchor),
            video_scores: vec![confidence; videos.len()],
            videos,
            confidence,
            strategy: Strategy::Timestamp,
            extracted_name: None,
            extracted_date_text: None,
            naming_note: None,
        }
    }

    #[test]
    fn test_render_lists_groups_and_review() {
        let mut plan = MatchPlan::empty(EngineState::Done);
        plan.complete = true;
        plan.groups.push(group(media("p1.jpg", 1), vec![media("v1.mp4", 2)], 0.92));

        let weak = group(media("p2.jpg", 3), vec![media("v2.mp4", 4)], 0.4);
        for file in weak.files() {
            plan.unresolved.push(UnresolvedFile {
                file: file.clone(),
                reason: UnresolvedReason::Demoted {
                    group: 0,
                    cause: DemotionCause::LowConfidence { confidence: 0.4 },
                },
            });
        }
        plan.demoted.push(DemotedGroup {
            group: weak,
            cause: DemotionCause::LowConfidence { confidence: 0.4 },
        });
        plan.unresolved.push(UnresolvedFile {
            file: media("v0.mp4", 0),
            reason: UnresolvedReason::NoPrecedingPhoto,
        });
        plan.skipped.push(SkippedFile {
            path: PathBuf::from("/in/notes.txt"),
            reason: SkipReason::Unsupported { mime: None },
        });

        let assignment = format_plan(&plan, &NamingOptions::default(), &HashSet::new(), 1);
        let text = render(&plan, &assignment);

        assert!(text.contains("[001] confidence 0.92 (timestamp)"));
        assert!(text.contains("    p1.jpg -> 001.jpg\n    v1.mp4 -> 001.mp4"));
        assert!(text.contains("group 1 (low confidence 0.40, timestamp):\n    p2.jpg\n    v2.mp4"));
        assert!(text.contains("  v0.mp4: no photo before this video"));
        // Demoted members are listed once, under their group
        assert!(!text.contains("p2.jpg: review"));
        assert!(text.contains("Skipped:\n  notes.txt"));
        assert!(text.ends_with("1 groups (1 videos), 1 for review, 3 unresolved files\n"));
    }

    #[test]
    fn test_incomplete_plan_is_marked() {
        let plan = MatchPlan::empty(EngineState::Cancelled);
        let text = render(&plan, &OutputAssignment::default());
        assert!(text.contains("[incomplete: Cancelled]"));
    }
}
