//! Progress reporting service
//!
//! Producers (the processor and the segmentation engine) write into a
//! per-attempt [`TaskProgress`]; consumers read [`ProgressUpdate`]s from a
//! [`ProgressStream`] or plug in a [`ProgressReporter`]. Dropping the stream
//! unsubscribes; producers never block on a slow or absent consumer.

use crate::types::{ProcessingTimings, TaskId};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Progress stages of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingStage {
    /// Waiting for a worker
    Queued,
    /// Producing preview and processing renditions
    Normalizing,
    /// Looking up a previous result
    CacheLookup,
    /// Creating the segmentation model
    ModelLoading,
    /// Converting the image into a model tensor
    Preprocessing,
    /// Running model inference
    Inference,
    /// Converting output tensor to mask
    MaskGeneration,
    /// Applying the mask and encoding the result
    Compositing,
    /// Storing the result for reuse
    Caching,
    /// Processing completed
    Completed,
}

impl ProcessingStage {
    /// Get a human-readable description of the processing stage
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            ProcessingStage::Queued => "Waiting to start",
            ProcessingStage::Normalizing => "Optimizing image",
            ProcessingStage::CacheLookup => "Checking previous results",
            ProcessingStage::ModelLoading => "Loading segmentation model",
            ProcessingStage::Preprocessing => "Preparing image for the model",
            ProcessingStage::Inference => "Removing background",
            ProcessingStage::MaskGeneration => "Generating segmentation mask",
            ProcessingStage::Compositing => "Creating transparent image",
            ProcessingStage::Caching => "Saving result",
            ProcessingStage::Completed => "Processing completed",
        }
    }

    /// Percentage band `(start, end)` covered by this stage
    #[must_use]
    pub fn progress_range(&self) -> (u8, u8) {
        match self {
            ProcessingStage::Queued => (0, 0),
            ProcessingStage::Normalizing => (0, 10),
            ProcessingStage::CacheLookup => (10, 12),
            ProcessingStage::ModelLoading => (12, 20),
            ProcessingStage::Preprocessing => (20, 25),
            ProcessingStage::Inference => (25, 80),
            ProcessingStage::MaskGeneration => (80, 88),
            ProcessingStage::Compositing => (88, 97),
            ProcessingStage::Caching => (97, 99),
            ProcessingStage::Completed => (100, 100),
        }
    }

    /// Get the progress percentage at which this stage starts
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        self.progress_range().0
    }

    /// Percentage reached after `fraction` of this stage
    #[must_use]
    pub fn percentage_at(&self, fraction: f32) -> u8 {
        let (start, end) = self.progress_range();
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        start + (f32::from(end - start) * fraction).floor() as u8
    }
}

/// One progress event
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: TaskId,
    /// Processing attempt the event belongs to (starts at 1)
    pub attempt: u32,
    /// Current processing stage
    pub stage: ProcessingStage,
    /// Progress percentage (0-100), non-decreasing within an attempt
    pub percentage: u8,
    /// Estimated seconds remaining
    pub eta_seconds: u32,
    /// Elapsed time since the attempt started (milliseconds)
    pub elapsed_ms: u64,
    /// Human-readable stage description
    pub description: String,
}

/// Aggregate progress of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgressUpdate {
    /// Items that reached a terminal outcome (success, failure or abort)
    pub finished: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// `finished * 100 / total`
    pub percentage: u8,
    /// Name of the item that just finished
    pub current_item: Option<String>,
    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,
}

/// Sending half of a progress channel
#[derive(Debug, Clone)]
pub struct ProgressSink {
    sender: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink {
    /// Deliver an update; returns `false` once the consumer is gone
    pub fn send(&self, update: ProgressUpdate) -> bool {
        self.sender.send(update).is_ok()
    }

    /// Whether the consumer dropped its stream
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Receiving half of a progress channel
#[derive(Debug)]
pub struct ProgressStream {
    inner: UnboundedReceiverStream<ProgressUpdate>,
}

impl ProgressStream {
    /// Wait for the next update; `None` once every sink is dropped
    pub async fn next_update(&mut self) -> Option<ProgressUpdate> {
        self.inner.next().await
    }

    /// Updates already delivered, without waiting
    pub fn drain_ready(&mut self) -> Vec<ProgressUpdate> {
        let receiver = self.inner.as_mut();
        let mut updates = Vec::new();
        while let Ok(update) = receiver.try_recv() {
            updates.push(update);
        }
        updates
    }

    /// Stop accepting updates; already queued ones can still be read
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl Stream for ProgressStream {
    type Item = ProgressUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Create a connected sink/stream pair
#[must_use]
pub fn progress_channel() -> (ProgressSink, ProgressStream) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ProgressSink { sender },
        ProgressStream {
            inner: UnboundedReceiverStream::new(receiver),
        },
    )
}

#[derive(Debug)]
struct ReportState {
    percentage: u8,
    stage: ProcessingStage,
}

/// Progress writer for one processing attempt of one task
///
/// Percentages never decrease. Events stop as soon as the task is
/// cancelled. Crossing the soft timeout is logged once and drives the
/// countdown ETA to zero; it never aborts the work.
#[derive(Debug)]
pub struct TaskProgress {
    task_id: TaskId,
    attempt: u32,
    sink: Option<ProgressSink>,
    cancel: CancellationToken,
    started: Instant,
    soft_timeout: Duration,
    state: Mutex<ReportState>,
    overdue_logged: AtomicBool,
}

impl TaskProgress {
    #[must_use]
    pub fn new(
        task_id: TaskId,
        attempt: u32,
        sink: Option<ProgressSink>,
        cancel: CancellationToken,
        soft_timeout: Duration,
    ) -> Self {
        Self {
            task_id,
            attempt,
            sink,
            cancel,
            started: Instant::now(),
            soft_timeout,
            state: Mutex::new(ReportState {
                percentage: 0,
                stage: ProcessingStage::Queued,
            }),
            overdue_logged: AtomicBool::new(false),
        }
    }

    /// Progress writer without a consumer or external cancellation
    #[must_use]
    pub fn detached(task_id: TaskId, soft_timeout: Duration) -> Self {
        Self::new(task_id, 1, None, CancellationToken::new(), soft_timeout)
    }

    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the attempt has run past the soft timeout
    #[must_use]
    pub fn is_overdue(&self) -> bool {
        self.elapsed() >= self.soft_timeout
    }

    /// Current percentage
    #[must_use]
    pub fn percentage(&self) -> u8 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).percentage
    }

    /// Estimated seconds remaining at `percentage`
    ///
    /// Extrapolates from elapsed time once there is enough signal, otherwise
    /// counts down from the soft timeout.
    #[must_use]
    pub fn eta_seconds(&self, percentage: u8) -> u32 {
        if percentage >= 100 {
            return 0;
        }
        let elapsed = self.elapsed();
        if percentage >= 5 {
            let remaining = elapsed.as_secs_f64() * f64::from(100 - percentage) / f64::from(percentage);
            return remaining.ceil() as u32;
        }
        self.soft_timeout.saturating_sub(elapsed).as_secs() as u32
    }

    /// Report the start of `stage`
    pub fn stage(&self, stage: ProcessingStage) {
        self.report(stage, stage.progress_percentage());
    }

    /// Report `fraction` (0.0-1.0) of `stage` done
    pub fn report_fraction(&self, stage: ProcessingStage, fraction: f32) {
        self.report(stage, stage.percentage_at(fraction));
    }

    /// Report an absolute percentage within `stage`
    pub fn report(&self, stage: ProcessingStage, percentage: u8) {
        if self.cancel.is_cancelled() {
            return;
        }

        if self.is_overdue() && !self.overdue_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                task = %self.task_id,
                elapsed_secs = self.elapsed().as_secs(),
                "still working after the expected time"
            );
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let percentage = percentage.min(100).max(state.percentage);
        let changed = percentage > state.percentage || stage != state.stage;
        state.percentage = percentage;
        state.stage = stage;
        if !changed {
            return;
        }

        if let Some(sink) = &self.sink {
            let update = ProgressUpdate {
                task_id: self.task_id,
                attempt: self.attempt,
                stage,
                percentage,
                eta_seconds: self.eta_seconds(percentage),
                elapsed_ms: self.elapsed().as_millis() as u64,
                description: stage.description().to_string(),
            };
            // Sent under the state lock so consumers observe the same order
            sink.send(update);
        }
    }
}

/// Trait for consuming progress
pub trait ProgressReporter: Send + Sync {
    /// Report a progress update
    ///
    /// # Arguments
    /// * `update` - Progress update containing stage and timing information
    fn report_progress(&self, update: ProgressUpdate);

    /// Report processing completion with final timings
    ///
    /// # Arguments
    /// * `task_id` - Task that completed
    /// * `timings` - Final processing timings
    fn report_completion(&self, task_id: TaskId, timings: &ProcessingTimings);

    /// Report an error during processing
    ///
    /// # Arguments
    /// * `task_id` - Task that failed
    /// * `error` - Error description
    fn report_error(&self, task_id: TaskId, error: &str);

    /// Report aggregate batch progress
    ///
    /// # Arguments
    /// * `update` - Finished/total counts for the batch
    fn report_batch_progress(&self, update: BatchProgressUpdate) {
        drop(update);
    }
}

/// No-op progress reporter that discards all progress updates
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_progress(&self, _update: ProgressUpdate) {}

    fn report_completion(&self, _task_id: TaskId, _timings: &ProcessingTimings) {}

    fn report_error(&self, _task_id: TaskId, _error: &str) {}
}

/// Console progress reporter that logs progress
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    /// Create a new console progress reporter
    ///
    /// # Arguments
    /// * `verbose` - Whether to show detailed progress information
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        if self.verbose {
            log::info!(
                "[{}] [{}%] {} ({}ms elapsed, ~{}s remaining)",
                update.task_id,
                update.percentage,
                update.description,
                update.elapsed_ms,
                update.eta_seconds
            );
        } else {
            log::info!("[{}%] {}", update.percentage, update.description);
        }
    }

    fn report_completion(&self, task_id: TaskId, timings: &ProcessingTimings) {
        log::info!("✅ {task_id} completed in {}ms", timings.total_ms);

        if self.verbose {
            log::info!("  📊 Detailed timings:");
            log::info!("    • Normalization: {}ms", timings.normalize_ms);
            log::info!("    • Segmentation: {}ms", timings.segment_ms);
            log::info!("    • Compositing: {}ms", timings.composite_ms);
            if timings.cache_hit {
                log::info!("    • Served from cache");
            }
        }
    }

    fn report_error(&self, task_id: TaskId, error: &str) {
        log::error!("❌ {task_id} failed: {error}");
    }

    fn report_batch_progress(&self, update: BatchProgressUpdate) {
        log::info!(
            "📁 Batch: {}/{} finished ({} succeeded, {} failed) [{}%]",
            update.finished,
            update.total,
            update.succeeded,
            update.failed,
            update.percentage
        );
    }
}

/// Drain a progress stream into a reporter until every sink is dropped
pub async fn forward_progress(mut stream: ProgressStream, reporter: &dyn ProgressReporter) -> usize {
    let mut forwarded = 0;
    while let Some(update) = stream.next_update().await {
        reporter.report_progress(update);
        forwarded += 1;
    }
    forwarded
}
