//! Background removal CLI tool
//!
//! Command-line interface that pushes local images and remote URLs through
//! the pipeline and writes `<stem>_processed.<ext>` files.

use super::config::CliConfigBuilder;
use crate::{
    intake::IncomingFile,
    scheduler::{BatchReport, BatchScheduler},
    services::{
        forward_progress, progress_channel, BatchProgressUpdate, ConsoleProgressReporter, ImageIOService,
        ProgressReporter, ProgressUpdate,
    },
    session::Session,
    tracing_config::{init_cli_tracing, spans},
    types::{processed_filename, ProcessingTimings, TaskId},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

/// Extensions picked up when scanning directories
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Background removal CLI tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bgremove-pipeline")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Input image files, directories or http(s) URLs
    #[arg(value_name = "INPUT", required = true)]
    pub input: Vec<String>,

    /// Output directory (defaults to each input's own directory)
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// JSON configuration file (overrides $BGREMOVE_PIPELINE_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the segmentation model
    #[arg(short, long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Inference backend
    #[arg(short, long, value_enum)]
    pub backend: Option<CliBackend>,

    /// Output format
    #[arg(short, long, value_enum)]
    pub format: Option<CliOutputFormat>,

    /// How the model's mask maps to alpha
    #[arg(long, value_enum)]
    pub mask_convention: Option<CliMaskConvention>,

    /// Images scheduled per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Images processed at the same time within a batch
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Longest edge of the rendition sent to the model
    #[arg(long)]
    pub max_dimension: Option<u32>,

    /// Inference threads (0 = let the backend decide)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Process directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// File name pattern for directory inputs (e.g. "*.jpg")
    #[arg(long)]
    pub pattern: Option<String>,

    /// Disable the result cache
    #[arg(long)]
    pub no_cache: bool,

    /// Show a progress bar
    #[arg(long)]
    pub progress: bool,

    /// Enable verbose logging (-v: crate DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Inference backend names accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliBackend {
    Tract,
    Onnx,
}

/// Output formats accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliOutputFormat {
    Png,
    Webp,
}

/// Mask conventions accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliMaskConvention {
    Foreground,
    Background,
}

/// Inputs sorted by how they enter the pipeline
#[derive(Debug, Default)]
struct Inputs {
    files: Vec<PathBuf>,
    urls: Vec<String>,
}

/// Main CLI entry point
///
/// # Errors
/// - Invalid arguments or configuration
/// - No usable inputs
/// - Every submitted image failed
pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let session_id = uuid::Uuid::new_v4().to_string();
    let _tracing = init_cli_tracing(cli.verbose, &session_id).context("Failed to initialize tracing")?;

    CliConfigBuilder::validate_cli(&cli)?;
    let config = CliConfigBuilder::from_cli(&cli)?;
    let span = spans::session(
        &session_id,
        &config.processing.model_name,
        &format!("{:?}", config.processing.backend),
    );
    info!(
        "Starting background removal: batch size {}, {} concurrent",
        config.batch.batch_size, config.batch.max_concurrent
    );

    let session = Arc::new(Session::new(config).context("Failed to create pipeline session")?);
    session.start_background_tasks();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling remaining work");
                cancel.cancel();
            }
        });
    }

    let result = run(&cli, &session, &cancel).instrument(span).await;
    session.shutdown().await;
    result
}

async fn run(cli: &Cli, session: &Arc<Session>, cancel: &CancellationToken) -> Result<()> {
    let inputs = collect_inputs(cli)?;
    if inputs.files.is_empty() && inputs.urls.is_empty() {
        anyhow::bail!("No supported images found in the given inputs");
    }

    let start_time = Instant::now();
    let reporter: Arc<dyn ProgressReporter> = if cli.progress {
        Arc::new(BarReporter::new(inputs.files.len()))
    } else {
        Arc::new(ConsoleProgressReporter::new(cli.verbose > 0))
    };

    let mut written = 0;
    let mut failed = 0;

    if !inputs.files.is_empty() {
        let report = run_files(cli, session, &inputs.files, Arc::clone(&reporter), cancel).await?;
        written += write_report(cli, &report).await?;
        failed += report.failed.len() + report.aborted.len();
        println!("{}", report.summary());
    }

    for url in &inputs.urls {
        if cancel.is_cancelled() {
            failed += 1;
            continue;
        }
        match process_url(cli, session, url, cancel).await {
            Ok(path) => {
                println!("{url} -> {}", path.display());
                written += 1;
            },
            Err(e) => {
                error!("{url}: {e:#}");
                failed += 1;
            },
        }
    }

    info!(
        "Wrote {} image(s) in {:.2}s",
        written,
        start_time.elapsed().as_secs_f64()
    );
    if written == 0 && failed > 0 {
        anyhow::bail!("All {failed} image(s) failed");
    }
    Ok(())
}

/// Run local files through the batch scheduler
async fn run_files(
    cli: &Cli,
    session: &Arc<Session>,
    paths: &[PathBuf],
    reporter: Arc<dyn ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let mut file = IncomingFile::from_path(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        // Full path so results can be written next to their source
        file.name = path.display().to_string();
        files.push(file);
    }

    let mut scheduler = BatchScheduler::new(Arc::clone(session)).with_reporter(Arc::clone(&reporter));
    let forwarder = if cli.progress || cli.verbose > 1 {
        let (sink, stream) = progress_channel();
        scheduler = scheduler.with_task_progress(sink);
        Some(tokio::spawn(async move { forward_progress(stream, reporter.as_ref()).await }))
    } else {
        None
    };

    let report = scheduler
        .run(files, cancel)
        .instrument(spans::batch(paths.len()))
        .await;
    drop(scheduler);

    if let Some(forwarder) = forwarder {
        match forwarder.await {
            Ok(forwarded) => debug!(forwarded, "task progress drained"),
            Err(e) => warn!("Progress forwarding stopped: {e}"),
        }
    }
    Ok(report)
}

async fn write_report(cli: &Cli, report: &BatchReport) -> Result<usize> {
    for failure in &report.failed {
        error!("{}: {}", failure.name, failure.error.reason);
    }
    for success in &report.succeeded {
        let filename = processed_filename(&success.name, success.output.format);
        let path = output_path(cli.output.as_deref(), Path::new(&success.name), &filename);
        write_output(&path, &success.output.bytes).await?;
        debug!(task = %success.task_id, cache_hit = success.timings.cache_hit, "written");
    }
    Ok(report.succeeded.len())
}

/// Fetch, process and write one remote image
async fn process_url(cli: &Cli, session: &Session, url: &str, cancel: &CancellationToken) -> Result<PathBuf> {
    let id = session.add_url(url).await.context("Failed to fetch image")?;
    session.prepare_cancellable(id, cancel).await?;
    session.process_cancellable(id, None, cancel).await?;

    let download = session.download(id).await?;
    let directory = cli.output.clone().unwrap_or_else(|| PathBuf::from("."));
    let path = directory.join(&download.filename);
    write_output(&path, &download.bytes).await?;
    session.delete(id)?;
    Ok(path)
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    ImageIOService::write_bytes(path, bytes)
        .instrument(spans::output(path))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Destination of a processed file: the output directory when given,
/// otherwise the source's own directory
fn output_path(output_dir: Option<&Path>, source: &Path, filename: &str) -> PathBuf {
    match output_dir {
        Some(dir) => dir.join(filename),
        None => source
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from(filename), |parent| parent.join(filename)),
    }
}

fn collect_inputs(cli: &Cli) -> Result<Inputs> {
    let mut inputs = Inputs::default();
    for input in &cli.input {
        if is_url(input) {
            inputs.urls.push(input.clone());
            continue;
        }
        let path = Path::new(input);
        if path.is_dir() {
            inputs
                .files
                .extend(find_image_files(path, cli.recursive, cli.pattern.as_deref())?);
        } else if path.is_file() {
            inputs.files.push(path.to_path_buf());
        } else {
            anyhow::bail!("Input not found: {input}");
        }
    }
    Ok(inputs)
}

fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Find all supported images in a directory, sorted by path
fn find_image_files(dir: &Path, recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let pattern = pattern
        .map(glob::Pattern::new)
        .transpose()
        .context("Invalid --pattern")?;
    let max_depth = if recursive { usize::MAX } else { 1 };

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).max_depth(max_depth) {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() && is_image_file(path) && matches_pattern(path, pattern.as_ref()) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn matches_pattern(path: &Path, pattern: Option<&glob::Pattern>) -> bool {
    match pattern {
        Some(pattern) => path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| pattern.matches(name)),
        None => true,
    }
}

/// Progress bar over the batch, with the latest stage as its message
struct BarReporter {
    bar: ProgressBar,
}

impl BarReporter {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl ProgressReporter for BarReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        self.bar
            .set_message(format!("{} {}% {}", update.task_id, update.percentage, update.description));
    }

    fn report_completion(&self, task_id: TaskId, timings: &ProcessingTimings) {
        debug!(task = %task_id, total_ms = timings.total_ms, "completed");
    }

    fn report_error(&self, task_id: TaskId, error: &str) {
        self.bar.println(format!("{task_id} failed: {error}"));
    }

    fn report_batch_progress(&self, update: BatchProgressUpdate) {
        self.bar.set_length(update.total as u64);
        self.bar.set_position(update.finished as u64);
        if let Some(item) = update.current_item {
            self.bar.set_message(item);
        }
        if update.finished == update.total {
            self.bar.finish_with_message(format!("{} succeeded, {} failed", update.succeeded, update.failed));
        }
    }
}
