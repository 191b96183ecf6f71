use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use ritual_core::writer;
use ritual_core::{
    preview, CancellationToken, CompressionPreset, MatchConfig, NamingTemplate, ProcessControl, ProcessOptions,
    Strategy, ThrottledProgress,
};

#[derive(Parser)]
#[command(
    name = "ritual-pair",
    version,
    about = "Pair ritual-session photos with their videos and copy them out under predictable names"
)]
struct Cli {
    /// Folder with one session's photos and videos
    input: PathBuf,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Matching configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// First matching strategy to try
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Only run the chosen strategy
    #[arg(long)]
    no_cascade: bool,

    #[arg(long)]
    similarity_threshold: Option<f64>,

    /// Groups below this confidence go to review
    #[arg(long)]
    confidence_floor: Option<f64>,

    /// Timeline positions searched around each video
    #[arg(long)]
    candidate_window: Option<usize>,

    #[arg(long)]
    ocr_confidence: Option<f32>,

    /// Never fall back to file modification times
    #[arg(long)]
    no_filesystem_time: bool,

    /// Worker threads for ffmpeg/tesseract calls (0 = one per core)
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum, default_value_t = NamingTemplate::Sequence)]
    template: NamingTemplate,

    #[arg(long, default_value_t = 3)]
    pad_width: usize,

    /// Prefix for --template prefix-sequence
    #[arg(long)]
    prefix: Option<String>,

    /// Show the plan without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Overwrite files already in the output directory
    #[arg(long)]
    force: bool,

    /// Re-encode photos and videos while copying
    #[arg(long, value_enum)]
    compress: Option<CompressionPreset>,

    /// Split the video of single-video groups into N parts (2-10)
    #[arg(long, default_value_t = 1)]
    split: u8,

    /// Do not record the written plan in the output directory
    #[arg(long)]
    no_manifest: bool,

    /// Print the plan as JSON instead of the text preview
    #[arg(long)]
    json: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn matching(&self) -> anyhow::Result<MatchConfig> {
        let mut config = match &self.config {
            Some(path) => {
                MatchConfig::load(path).with_context(|| format!("loading {}", path.display()))?
            }
            None => MatchConfig::default(),
        };
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if self.no_cascade {
            config.cascade = false;
        }
        if let Some(v) = self.similarity_threshold {
            config.similarity_threshold = v;
        }
        if let Some(v) = self.confidence_floor {
            config.confidence_floor = v;
        }
        if let Some(v) = self.candidate_window {
            config.candidate_window = v;
        }
        if let Some(v) = self.ocr_confidence {
            config.ocr_confidence_threshold = v;
        }
        if self.no_filesystem_time {
            config.use_filesystem_time = false;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        Ok(config)
    }

    fn options(&self) -> anyhow::Result<ProcessOptions> {
        let mut options = ProcessOptions::new(&self.input, &self.output);
        options.matching = self.matching()?;
        options.naming.template = self.template;
        options.naming.pad_width = self.pad_width;
        options.naming.prefix = self.prefix.clone();
        options.force = self.force;
        options.compress = self.compress;
        options.split_segments = self.split;
        options.write_manifest = !self.no_manifest;
        Ok(options)
    }
}

/// One bar, restarted whenever the stage changes.
struct StageBar {
    bar: ProgressBar,
    stage: Mutex<String>,
}

impl StageBar {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:>6} [{bar:40}] {pos}/{len} {wide_msg}")
                .unwrap(),
        );
        Self {
            bar,
            stage: Mutex::new(String::new()),
        }
    }

    fn update(&self, stage: &str, current: u64, total: u64, message: &str) {
        let mut current_stage = self.stage.lock().unwrap();
        if *current_stage != stage {
            *current_stage = stage.to_string();
            self.bar.reset();
            self.bar.set_prefix(stage.to_string());
        }
        self.bar.set_length(total);
        self.bar.set_position((current + 1).min(total));
        self.bar.set_message(message.to_string());
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    let t_total = std::time::Instant::now();

    let options = cli.options()?;
    options.validate()?;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nCancelling, waiting for running tools to finish...");
            token.cancel();
        })
        .context("installing Ctrl-C handler")?;
    }
    let control = ProcessControl::new().with_cancel_token(token.clone());

    let bar = StageBar::new();
    let callback = |stage: &str, current: u64, total: u64, message: &str| bar.update(stage, current, total, message);

    // Plan first, so the preview is on screen before anything is copied
    let plan_only = ProcessOptions {
        dry_run: true,
        ..options.clone()
    };
    let mut result = ritual_core::process_with_control(&plan_only, &control, &callback)?;
    bar.bar.finish_and_clear();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result.plan)?);
    } else {
        print!("{}", preview::render(&result.plan, &result.assignment));
    }
    for warning in &result.warnings {
        log::warn!("{warning}");
    }

    if result.cancelled || !result.plan.complete {
        eprintln!("Cancelled before the plan was complete; nothing written.");
        return Ok(());
    }
    if cli.dry_run {
        eprintln!("Dry run: nothing written ({:.2}s)", t_total.elapsed().as_secs_f64());
        return Ok(());
    }

    let write_options = options.write_options();
    let tp = ThrottledProgress::new(&callback);
    let written = match writer::write_output(
        &result.plan,
        &result.assignment,
        &options.output,
        &write_options,
        &tp,
        Some(&token),
    ) {
        Ok(written) => written,
        Err(ritual_core::Error::Cancelled) => {
            bar.bar.finish_and_clear();
            eprintln!("Cancelled; partial output will be redone on the next run.");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("writing to {}", options.output.display())),
    };
    bar.bar.finish_and_clear();
    result.files_written = written.files_written;
    result.files_skipped = written.files_skipped;
    for warning in &written.warnings {
        eprintln!("warning: {warning}");
    }

    eprintln!(
        "Done! {} groups, {} files written, {} unchanged, {} for review, {} unresolved ({:.2}s)",
        result.plan.groups.len(),
        result.files_written,
        result.files_skipped,
        result.plan.demoted.len(),
        result.plan.unresolved.len(),
        t_total.elapsed().as_secs_f64()
    );

    Ok(())
}
