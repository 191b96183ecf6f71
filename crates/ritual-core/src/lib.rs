pub mod cache;
pub mod cancel;
pub mod config;
pub mod date;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod frames;
pub mod manifest;
pub mod media;
pub mod naming;
pub mod ocr;
pub mod plan;
pub mod preview;
pub mod scan;
pub mod strategy;
pub mod transcode;
pub mod writer;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use cancel::CancellationToken;
pub use config::MatchConfig;
pub use engine::{EngineState, MatchEngine};
pub use error::{Error, Result};
pub use naming::{NamingOptions, NamingTemplate, OutputAssignment};
pub use plan::MatchPlan;
pub use strategy::Strategy;
pub use transcode::CompressionPreset;

fn default_split_segments() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Folder holding one ritual session's photos and videos
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub matching: MatchConfig,
    #[serde(default)]
    pub naming: NamingOptions,
    /// Build and report the plan without writing anything
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub compress: Option<CompressionPreset>,
    #[serde(default = "default_split_segments")]
    pub split_segments: u8,
    #[serde(default = "default_true")]
    pub write_manifest: bool,
}

impl ProcessOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            matching: MatchConfig::default(),
            naming: NamingOptions::default(),
            dry_run: false,
            force: false,
            compress: None,
            split_segments: default_split_segments(),
            write_manifest: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        self.naming.validate()?;
        if self.split_segments != 1
            && !(transcode::MIN_SEGMENTS..=transcode::MAX_SEGMENTS).contains(&self.split_segments)
        {
            return Err(Error::InvalidConfig(format!(
                "split_segments must be 1 or within {}..={}, got {}",
                transcode::MIN_SEGMENTS,
                transcode::MAX_SEGMENTS,
                self.split_segments
            )));
        }
        Ok(())
    }

    pub fn write_options(&self) -> writer::WriteOptions {
        writer::WriteOptions {
            force: self.force,
            compress: self.compress,
            split_segments: self.split_segments,
            write_manifest: self.write_manifest,
            workers: self.matching.workers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub plan: MatchPlan,
    pub assignment: OutputAssignment,
    pub files_written: u64,
    #[serde(default)]
    pub files_skipped: u64,
    /// Groups that could not use the requested naming template
    #[serde(default)]
    pub ocr_fallbacks: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// The run was cancelled before output was written
    #[serde(default)]
    pub cancelled: bool,
}

/// Control options for process execution.
#[derive(Debug, Clone, Default)]
pub struct ProcessControl {
    pub cancel_token: Option<CancellationToken>,
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Type alias for progress callback: `(stage, current, total, message)`.
pub type ProgressCallback<'a> = dyn Fn(&str, u64, u64, &str) + Send + Sync + 'a;

fn no_progress(_: &str, _: u64, _: u64, _: &str) {}

static NO_PROGRESS: fn(&str, u64, u64, &str) = no_progress;

/// Throttled progress reporter: emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback<'a>,
    last_emit: std::sync::Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback<'a>) -> Self {
        Self {
            inner,
            last_emit: std::sync::Mutex::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    /// Reporter that drops every update.
    pub fn silent() -> ThrottledProgress<'static> {
        ThrottledProgress::new(&NO_PROGRESS)
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap();
            if last.elapsed() < Duration::from_millis(200) {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Run the full pipeline with the `ffmpeg`/`tesseract` backed engine.
pub fn process(options: &ProcessOptions, progress_callback: &ProgressCallback<'_>) -> Result<ProcessResult> {
    process_with_control(options, &ProcessControl::default(), progress_callback)
}

/// Run the full pipeline with progress reporting and control options.
pub fn process_with_control(
    options: &ProcessOptions,
    control: &ProcessControl,
    progress_callback: &ProgressCallback<'_>,
) -> Result<ProcessResult> {
    let mut engine = MatchEngine::new(options.matching.clone());
    process_with_engine(&mut engine, options, control, progress_callback)
}

/// Run the pipeline on a caller-built engine. `options.matching` is ignored
/// in favour of the engine's own configuration.
pub fn process_with_engine(
    engine: &mut MatchEngine,
    options: &ProcessOptions,
    control: &ProcessControl,
    progress_callback: &ProgressCallback<'_>,
) -> Result<ProcessResult> {
    options.validate()?;
    let tp = ThrottledProgress::new(progress_callback);
    let cancel = control.cancel_token.as_ref();
    if let Some(token) = cancel {
        token.check()?;
    }

    // Stage 1-3: scan, match, resolve (and read names off anchors)
    let plan = match engine.run(&options.input, options.naming.needs_names(), &tp, cancel) {
        Ok(plan) => plan,
        Err(Error::Cancelled) => MatchPlan::empty(EngineState::Cancelled),
        Err(e) => return Err(e),
    };
    log::info!(
        "{} groups, {} for review, {} unresolved files",
        plan.groups.len(),
        plan.demoted.len(),
        plan.unresolved.len()
    );

    // Stage 4: names
    let reserved = if options.force {
        Default::default()
    } else {
        writer::existing_names(&options.output)
    };
    let assignment = naming::format_plan(&plan, &options.naming, &reserved, options.split_segments);
    let mut warnings = plan.warnings.clone();
    for &index in &assignment.fallbacks {
        // OCR failures were already reported by the engine
        if plan.groups[index].naming_note.is_none() {
            warnings.push(format!("group {} named by sequence: {:?} not applicable", index + 1, options.naming.template));
        }
    }

    let mut result = ProcessResult {
        ocr_fallbacks: assignment.fallbacks.len(),
        cancelled: plan.state == EngineState::Cancelled,
        plan,
        assignment,
        files_written: 0,
        files_skipped: 0,
        warnings,
    };

    if options.dry_run {
        return Ok(result);
    }
    if !result.plan.complete {
        log::warn!("plan ended in {:?}, nothing written", result.plan.state);
        return Ok(result);
    }

    // Stage 5: write
    let written = match writer::write_output(
        &result.plan,
        &result.assignment,
        &options.output,
        &options.write_options(),
        &tp,
        cancel,
    ) {
        Ok(written) => written,
        Err(Error::Cancelled) => {
            result.cancelled = true;
            return Ok(result);
        }
        Err(e) => return Err(e),
    };
    result.files_written = written.files_written;
    result.files_skipped = written.files_skipped;
    result.warnings.extend(written.warnings);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_throttled_progress_always_emits_completion() {
        let calls = AtomicU64::new(0);
        let cb = |_: &str, _: u64, _: u64, _: &str| {
            calls.fetch_add(1, Ordering::Relaxed);
        };
        let tp = ThrottledProgress::new(&cb);
        for i in 0..100 {
            tp.report("test", i, 100, "");
        }
        // First update and the final one
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_options_from_partial_json() {
        let options: ProcessOptions = serde_json::from_str(
            r#"{"input": "/in", "output": "/out", "naming": {"template": "name-sequence"}}"#,
        )
        .unwrap();
        assert_eq!(options.split_segments, 1);
        assert!(options.write_manifest);
        assert_eq!(options.naming.template, NamingTemplate::NameSequence);
        assert_eq!(options.naming.pad_width, 3);
        assert_eq!(options.matching.strategy, Strategy::Timestamp);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_reject_split_count() {
        let mut options = ProcessOptions::new("/in", "/out");
        options.split_segments = 11;
        assert!(matches!(options.validate(), Err(Error::InvalidConfig(_))));
        options.split_segments = 0;
        assert!(options.validate().is_err());
        options.split_segments = 4;
        assert!(options.validate().is_ok());
    }
}
