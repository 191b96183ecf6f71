//! The match engine: runs the strategy cascade over a scanned folder and
//! resolves the result into a [`MatchPlan`].
//!
//! The engine is the only writer of group membership. Strategies propose
//! drafts over file indices; the engine checks them, demotes what needs
//! review and verifies that every scanned file ends up exactly once in
//! either a confident group or the unresolved list.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cache::BatchCache;
use crate::cancel::{is_cancelled, CancellationToken};
use crate::config::MatchConfig;
use crate::error::{Error, Result};
use crate::frames::{FfmpegSampler, FrameSampler};
use crate::media::MediaFile;
use crate::ocr::{OcrNameExtractor, TesseractCli, TextRecognizer};
use crate::plan::{DemotedGroup, DemotionCause, MatchGroup, MatchPlan, UnresolvedFile, UnresolvedReason};
use crate::scan::{self, ScanResult};
use crate::strategy::timeline::{filename_order, timeline_order};
use crate::strategy::{DraftGroup, MatchContext, ResolvedSet, Strategy};
use crate::ThrottledProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Scanning,
    Matching,
    Resolving,
    Done,
    Failed,
    Cancelled,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Done | EngineState::Failed | EngineState::Cancelled)
    }

    /// Legal forward transitions. A run may start at `Matching` when the
    /// caller already has a scan.
    pub fn allows(self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Idle, Scanning)
                | (Idle, Matching)
                | (Scanning, Matching)
                | (Matching, Resolving)
                | (Resolving, Done)
                | (Scanning | Matching | Resolving, Failed | Cancelled)
        )
    }
}

pub struct MatchEngine {
    config: MatchConfig,
    sampler: Box<dyn FrameSampler>,
    recognizer: Box<dyn TextRecognizer>,
    state: EngineState,
}

impl MatchEngine {
    /// Engine backed by the `ffmpeg` and `tesseract` command line tools.
    pub fn new(config: MatchConfig) -> Self {
        Self::with_tools(config, Box::new(FfmpegSampler), Box::new(TesseractCli::default()))
    }

    pub fn with_tools(
        config: MatchConfig,
        sampler: Box<dyn FrameSampler>,
        recognizer: Box<dyn TextRecognizer>,
    ) -> Self {
        Self {
            config,
            sampler,
            recognizer,
            state: EngineState::Idle,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    fn transition(&mut self, next: EngineState) -> Result<()> {
        if !self.state.allows(next) {
            return Err(Error::InvariantViolation(format!(
                "illegal engine transition {:?} -> {:?}",
                self.state, next
            )));
        }
        log::debug!("engine: {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn build_pool(&self) -> Result<rayon::ThreadPool> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if self.config.workers > 0 {
            builder = builder.num_threads(self.config.workers);
        }
        Ok(builder.build()?)
    }

    /// Scan `folder` and match its contents. With `extract_names`, subject
    /// names are read off every confident group's anchor photo.
    pub fn run(
        &mut self,
        folder: &Path,
        extract_names: bool,
        progress: &ThrottledProgress,
        cancel: Option<&CancellationToken>,
    ) -> Result<MatchPlan> {
        self.config.validate()?;
        self.state = EngineState::Idle;
        let pool = self.build_pool()?;

        self.transition(EngineState::Scanning)?;
        let scan = match scan::scan_folder(folder, self.config.use_filesystem_time, &pool, progress, cancel) {
            Ok(scan) => scan,
            Err(Error::Cancelled) => {
                self.state = EngineState::Cancelled;
                return Err(Error::Cancelled);
            }
            Err(e) => {
                self.state = EngineState::Failed;
                return Err(e);
            }
        };
        self.match_scanned(scan, extract_names, &pool, progress, cancel)
    }

    /// Match files that were scanned elsewhere.
    pub fn run_on(
        &mut self,
        scan: ScanResult,
        extract_names: bool,
        progress: &ThrottledProgress,
        cancel: Option<&CancellationToken>,
    ) -> Result<MatchPlan> {
        self.config.validate()?;
        self.state = EngineState::Idle;
        let pool = self.build_pool()?;
        self.match_scanned(scan, extract_names, &pool, progress, cancel)
    }

    fn match_scanned(
        &mut self,
        scan: ScanResult,
        extract_names: bool,
        pool: &rayon::ThreadPool,
        progress: &ThrottledProgress,
        cancel: Option<&CancellationToken>,
    ) -> Result<MatchPlan> {
        let result = self.match_inner(scan, extract_names, pool, progress, cancel);
        if result.is_err() && !self.state.is_terminal() {
            self.state = EngineState::Failed;
        }
        result
    }

    fn match_inner(
        &mut self,
        scan: ScanResult,
        extract_names: bool,
        pool: &rayon::ThreadPool,
        progress: &ThrottledProgress,
        cancel: Option<&CancellationToken>,
    ) -> Result<MatchPlan> {
        self.transition(EngineState::Matching)?;
        let ScanResult { media: files, skipped } = scan;
        if let Some((i, f)) = files.iter().enumerate().find(|(i, f)| f.filename_order != *i) {
            return Err(Error::InvariantViolation(format!(
                "{} has filename_order {} at position {i}",
                f.filename, f.filename_order
            )));
        }

        // Scoped to this run; dropped on return
        let cache = BatchCache::new(files.len());
        let mut resolved = ResolvedSet::new(files.len());
        let mut drafts: Vec<DraftGroup> = Vec::new();
        let mut reasons: Vec<Option<UnresolvedReason>> = vec![None; files.len()];
        let mut warnings = Vec::new();
        let mut cancelled = false;

        let chain = self.config.strategy.chain(self.config.cascade);
        let ctx = MatchContext {
            config: &self.config,
            sampler: self.sampler.as_ref(),
            cache: &cache,
            pool,
            cancel,
        };
        for (step, &strategy) in chain.iter().enumerate() {
            if is_cancelled(cancel) {
                cancelled = true;
                break;
            }
            progress.report("match", step as u64, chain.len() as u64, strategy.name());
            let outcome = strategy.attempt(&files, &resolved, &ctx);
            warnings.extend(outcome.warnings);
            if outcome.cancelled {
                cancelled = true;
                break;
            }

            for group in &outcome.groups {
                check_draft(&files, group)?;
                for i in group.files() {
                    if !resolved.insert(i) {
                        return Err(Error::InvariantViolation(format!(
                            "{} proposed {} which is already grouped",
                            strategy.name(),
                            files[i].filename
                        )));
                    }
                }
            }
            for (i, reason) in outcome.unresolved {
                if let Some(slot) = reasons.get_mut(i) {
                    *slot = Some(reason);
                }
            }
            log::info!(
                "{}: {} groups, {} files still unresolved",
                strategy.name(),
                outcome.groups.len(),
                files.len() - (0..files.len()).filter(|&i| resolved.contains(i)).count()
            );
            drafts.extend(outcome.groups);

            if resolved.is_complete() {
                break;
            }
        }
        progress.report("match", chain.len() as u64, chain.len() as u64, "Matched");

        if cancelled {
            log::warn!("matching cancelled; keeping {} groups for preview", drafts.len());
            self.transition(EngineState::Cancelled)?;
            let mut plan = self.assemble(&files, drafts, reasons, true);
            plan.skipped = skipped;
            warnings.append(&mut plan.warnings);
            plan.warnings = warnings;
            plan.check_partition(&files)?;
            plan.state = EngineState::Cancelled;
            return Ok(plan);
        }

        self.transition(EngineState::Resolving)?;
        let mut plan = self.assemble(&files, drafts, reasons, false);
        plan.skipped = skipped;
        warnings.append(&mut plan.warnings);
        plan.warnings = warnings;
        plan.check_partition(&files)?;

        if extract_names && !plan.groups.is_empty() {
            if !self.annotate_names(&mut plan, &cache, pool, progress, cancel) {
                log::warn!("name extraction cancelled");
                self.transition(EngineState::Cancelled)?;
                plan.state = EngineState::Cancelled;
                return Ok(plan);
            }
        }

        self.transition(EngineState::Done)?;
        plan.state = EngineState::Done;
        plan.complete = true;
        Ok(plan)
    }

    /// Turn drafts into the plan: demote, order, and list every leftover file.
    fn assemble(
        &self,
        files: &[MediaFile],
        mut drafts: Vec<DraftGroup>,
        reasons: Vec<Option<UnresolvedReason>>,
        cancelled: bool,
    ) -> MatchPlan {
        let order = match self.config.strategy {
            Strategy::Sequential => filename_order(files),
            Strategy::Similarity | Strategy::Timestamp => timeline_order(files),
        };
        let mut position = vec![0usize; files.len()];
        for (pos, &i) in order.iter().enumerate() {
            position[i] = pos;
        }
        drafts.sort_by_key(|d| d.files().next().map(|i| position[i]).unwrap_or(usize::MAX));

        let mut plan = MatchPlan::empty(EngineState::Resolving);
        let mut demoted_of: HashMap<usize, usize> = HashMap::new();

        for draft in drafts {
            let group = materialize(files, &draft);
            let cause = if let Some(video) = draft.ambiguous_video {
                let ambiguity = Error::AmbiguousMatch {
                    anchor: group.anchor.as_ref().map(|a| a.path.clone()).unwrap_or_default(),
                    video: files[video].path.clone(),
                };
                log::warn!("{ambiguity}");
                plan.warnings.push(ambiguity.to_string());
                Some(DemotionCause::Ambiguous {
                    video: files[video].path.clone(),
                })
            } else if group.confidence < self.config.confidence_floor {
                Some(DemotionCause::LowConfidence {
                    confidence: group.confidence,
                })
            } else {
                None
            };

            match cause {
                Some(cause) => {
                    for i in draft.files() {
                        demoted_of.insert(i, plan.demoted.len());
                    }
                    plan.demoted.push(DemotedGroup { group, cause });
                }
                None => plan.groups.push(group),
            }
        }

        let grouped: Vec<bool> = {
            let mut grouped = vec![false; files.len()];
            for group in &plan.groups {
                for f in group.files() {
                    grouped[f.filename_order] = true;
                }
            }
            grouped
        };

        for &i in &order {
            if grouped[i] {
                continue;
            }
            let reason = if let Some(&g) = demoted_of.get(&i) {
                UnresolvedReason::Demoted {
                    group: g,
                    cause: plan.demoted[g].cause.clone(),
                }
            } else if cancelled {
                UnresolvedReason::Cancelled
            } else {
                match &reasons[i] {
                    Some(reason) => reason.clone(),
                    None if files[i].is_photo() => UnresolvedReason::NoMatchedVideo,
                    None => UnresolvedReason::NoPrecedingPhoto,
                }
            };
            plan.unresolved.push(UnresolvedFile {
                file: files[i].clone(),
                reason,
            });
        }

        log::info!(
            "{} confident groups, {} demoted, {} unresolved files",
            plan.groups.len(),
            plan.demoted.len(),
            plan.unresolved.len()
        );
        plan
    }

    /// Read subject names for all confident groups. Returns `false` when
    /// cancelled before every anchor was read.
    fn annotate_names(
        &self,
        plan: &mut MatchPlan,
        cache: &BatchCache,
        pool: &rayon::ThreadPool,
        progress: &ThrottledProgress,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        let extractor = OcrNameExtractor::new(self.recognizer.as_ref(), &self.config);
        let anchors: Vec<&MediaFile> = plan.groups.iter().filter_map(|g| g.anchor.as_ref()).collect();
        let total = anchors.len() as u64;
        let done = AtomicU64::new(0);

        pool.install(|| {
            anchors.par_iter().for_each(|anchor| {
                if is_cancelled(cancel) {
                    return;
                }
                let _ = cache.reading(anchor.filename_order, || {
                    extractor.extract(&anchor.path).map_err(|e| e.to_string())
                });
                let n = done.fetch_add(1, Ordering::Relaxed);
                progress.report("ocr", n, total, &anchor.filename);
            });
        });
        if is_cancelled(cancel) {
            return false;
        }

        for group in &mut plan.groups {
            let Some(anchor) = &group.anchor else {
                group.naming_note = Some("no anchor photo to read a name from".into());
                continue;
            };
            match cache.cached_reading(anchor.filename_order) {
                Some(Ok(reading)) => {
                    group.extracted_name = Some(reading.name.clone());
                    group.extracted_date_text = reading.date_text.clone();
                }
                Some(Err(detail)) => {
                    log::warn!("{detail}");
                    plan.warnings.push(detail.clone());
                    group.naming_note = Some(detail.clone());
                }
                None => group.naming_note = Some("name was not read".into()),
            }
        }
        true
    }
}

fn check_draft(files: &[MediaFile], draft: &DraftGroup) -> Result<()> {
    let bad = |what: &str| Err(Error::InvariantViolation(format!("{} draft {what}", draft.strategy.name())));
    if draft.members.len() != draft.member_scores.len() {
        return bad("has unscored members");
    }
    if draft.anchor.is_none() && draft.members.is_empty() {
        return bad("is empty");
    }
    if let Some(a) = draft.anchor {
        if files.get(a).map_or(true, |f| !f.is_photo()) {
            return bad("anchors a non-photo");
        }
    }
    if draft.members.iter().any(|&v| files.get(v).map_or(true, |f| !f.is_video())) {
        return bad("has a non-video member");
    }
    Ok(())
}

fn materialize(files: &[MediaFile], draft: &DraftGroup) -> MatchGroup {
    MatchGroup {
        anchor: draft.anchor.map(|a| files[a].clone()),
        videos: draft.members.iter().map(|&v| files[v].clone()).collect(),
        video_scores: draft.member_scores.clone(),
        confidence: draft.confidence(),
        strategy: draft.strategy,
        extracted_name: None,
        extracted_date_text: None,
        naming_note: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::MockFrameSampler;
    use crate::media::{MediaKind, TimeSource};
    use crate::ocr::MockRecognizer;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn scan_of(entries: &[(&str, Option<u32>)]) -> ScanResult {
        let media = entries
            .iter()
            .enumerate()
            .map(|(order, (name, minute))| {
                let path = PathBuf::from(format!("/in/{name}"));
                let kind = MediaKind::from_path(&path).unwrap();
                let file = MediaFile::new(path, kind, order);
                match minute {
                    Some(m) => file.with_timestamp(
                        NaiveDate::from_ymd_opt(2024, 1, 31).unwrap().and_hms_opt(9, *m, 0).unwrap(),
                        TimeSource::Exif,
                    ),
                    None => file,
                }
            })
            .collect();
        ScanResult {
            media,
            skipped: vec![],
        }
    }

    fn engine(config: MatchConfig) -> MatchEngine {
        MatchEngine::with_tools(
            config,
            Box::new(MockFrameSampler::with_fn(|p| {
                Err(Error::tool("mock sampler", p.display().to_string()))
            })),
            Box::new(MockRecognizer::with_lines(&[])),
        )
    }

    fn names(group: &MatchGroup) -> Vec<&str> {
        group.files().map(|f| f.filename.as_str()).collect()
    }

    #[test]
    fn test_state_transitions() {
        use EngineState::*;
        assert!(Idle.allows(Scanning));
        assert!(Resolving.allows(Done));
        assert!(Matching.allows(Cancelled));
        assert!(!Idle.allows(Done));
        assert!(!Done.allows(Matching));
        assert!(!Idle.allows(Failed));
        assert!(!Cancelled.allows(Resolving));
    }

    #[test]
    fn test_timestamp_run_reaches_done() {
        let scan = scan_of(&[("p1.jpg", Some(1)), ("v1.mp4", Some(2)), ("v2.mp4", Some(3)), ("p2.jpg", Some(4))]);
        let files = scan.media.clone();
        let mut engine = engine(MatchConfig::default());

        let plan = engine.run_on(scan, false, &ThrottledProgress::silent(), None).unwrap();
        assert_eq!(engine.state(), EngineState::Done);
        assert!(plan.complete);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(names(&plan.groups[0]), vec!["p1.jpg", "v1.mp4", "v2.mp4"]);
        assert_eq!(names(&plan.groups[1]), vec!["p2.jpg"]);
        assert!(plan.check_partition(&files).is_ok());
    }

    #[test]
    fn test_untimed_files_join_the_timeline_after_timed_ones() {
        // Timeline: p1, v1, then the untimed p2, v2 in filename order
        let scan = scan_of(&[("p1.jpg", Some(1)), ("p2.jpg", None), ("v2.mp4", None), ("v1.mp4", Some(2))]);
        let files = scan.media.clone();
        let mut config = MatchConfig::default();
        config.confidence_floor = 0.0;
        let plan = engine(config).run_on(scan, false, &ThrottledProgress::silent(), None).unwrap();

        assert_eq!(plan.groups.len(), 2);
        assert_eq!(names(&plan.groups[0]), vec!["p1.jpg", "v1.mp4"]);
        assert_eq!(names(&plan.groups[1]), vec!["p2.jpg", "v2.mp4"]);
        assert!(plan.groups.iter().all(|g| g.strategy == Strategy::Timestamp));
        assert!(plan.check_partition(&files).is_ok());
    }

    #[test]
    fn test_leading_untimed_video_joins_photo() {
        let scan = scan_of(&[("a_clip.mp4", None), ("b_photo.jpg", Some(1))]);
        let plan = engine(MatchConfig::default())
            .run_on(scan, false, &ThrottledProgress::silent(), None)
            .unwrap();
        assert!(plan.unresolved.is_empty());
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(names(&plan.groups[0]), vec!["b_photo.jpg", "a_clip.mp4"]);
        assert_eq!(plan.groups[0].strategy, Strategy::Timestamp);
        assert_eq!(plan.groups[0].confidence, 0.5);
    }

    #[test]
    fn test_untimed_folder_cascades_to_sequential() {
        let scan = scan_of(&[("p1.jpg", None), ("v1.mp4", None), ("p2.jpg", None)]);
        let plan = engine(MatchConfig::default())
            .run_on(scan, false, &ThrottledProgress::silent(), None)
            .unwrap();
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(names(&plan.groups[0]), vec!["p1.jpg", "v1.mp4"]);
        assert!(plan.groups.iter().all(|g| g.strategy == Strategy::Sequential));
    }

    #[test]
    fn test_without_cascade_untimed_video_still_groups() {
        let scan = scan_of(&[("p1.jpg", Some(1)), ("v1.mp4", None)]);
        let mut config = MatchConfig::default();
        config.cascade = false;
        let plan = engine(config).run_on(scan, false, &ThrottledProgress::silent(), None).unwrap();
        assert!(plan.unresolved.is_empty());
        assert_eq!(names(&plan.groups[0]), vec!["p1.jpg", "v1.mp4"]);
    }

    #[test]
    fn test_without_cascade_leftovers_are_unresolved() {
        let scan = scan_of(&[("p1.jpg", None), ("v1.mp4", None)]);
        let mut config = MatchConfig::default();
        config.cascade = false;
        let plan = engine(config).run_on(scan, false, &ThrottledProgress::silent(), None).unwrap();
        assert!(plan.groups.is_empty());
        assert_eq!(plan.unresolved.len(), 2);
        assert!(plan.unresolved.iter().all(|u| u.reason == UnresolvedReason::NoTimestamp));
    }

    #[test]
    fn test_low_confidence_group_is_demoted() {
        // Sequential assignments score 0.6
        let scan = scan_of(&[("p1.jpg", None), ("v1.mp4", None)]);
        let mut config = MatchConfig::default();
        config.strategy = Strategy::Sequential;
        config.confidence_floor = 0.7;
        let plan = engine(config).run_on(scan, false, &ThrottledProgress::silent(), None).unwrap();

        assert!(plan.groups.is_empty());
        assert_eq!(plan.demoted.len(), 1);
        assert_eq!(plan.unresolved.len(), 2);
        assert!(matches!(
            plan.unresolved[0].reason,
            UnresolvedReason::Demoted {
                group: 0,
                cause: DemotionCause::LowConfidence { .. }
            }
        ));
    }

    #[test]
    fn test_similarity_failures_fall_through_to_timestamp() {
        // The sampler always fails, photos are not on disk
        let scan = scan_of(&[("p1.jpg", Some(1)), ("v1.mp4", Some(2))]);
        let mut config = MatchConfig::default();
        config.strategy = Strategy::Similarity;
        let plan = engine(config).run_on(scan, false, &ThrottledProgress::silent(), None).unwrap();

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].strategy, Strategy::Timestamp);
        assert!(!plan.warnings.is_empty());
    }

    #[test]
    fn test_cancelled_run_is_incomplete() {
        let scan = scan_of(&[("p1.jpg", Some(1)), ("v1.mp4", Some(2))]);
        let files = scan.media.clone();
        let token = CancellationToken::new();
        token.cancel();
        let mut engine = engine(MatchConfig::default());

        let plan = engine.run_on(scan, false, &ThrottledProgress::silent(), Some(&token)).unwrap();
        assert_eq!(engine.state(), EngineState::Cancelled);
        assert_eq!(plan.state, EngineState::Cancelled);
        assert!(!plan.complete);
        assert!(plan.unresolved.iter().all(|u| u.reason == UnresolvedReason::Cancelled));
        assert!(plan.check_partition(&files).is_ok());
    }

    #[test]
    fn test_out_of_order_scan_is_invariant_violation() {
        let mut scan = scan_of(&[("p1.jpg", Some(1)), ("v1.mp4", Some(2))]);
        scan.media.swap(0, 1);
        let mut engine = engine(MatchConfig::default());
        let err = engine.run_on(scan, false, &ThrottledProgress::silent(), None).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn test_name_failures_become_notes() {
        // Anchor photos do not exist on disk, so OCR cannot open them
        let scan = scan_of(&[("p1.jpg", Some(1)), ("v1.mp4", Some(2))]);
        let plan = engine(MatchConfig::default())
            .run_on(scan, true, &ThrottledProgress::silent(), None)
            .unwrap();
        assert!(plan.complete);
        assert!(plan.groups[0].extracted_name.is_none());
        assert!(plan.groups[0].naming_note.is_some());
    }
}
