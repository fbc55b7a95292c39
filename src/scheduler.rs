//! Batch scheduling
//!
//! A multi-image upload is split into batches of `batch_size`. Within a
//! batch, normalization and processing each run at most `max_concurrent`
//! items at a time; segmentation itself stays serialized by the engine.
//! Items fail independently. Only a model load failure or cancellation stops
//! the remaining batches, and results already produced are kept.

use crate::{
    config::BatchConstraints,
    error::{ErrorKind, PipelineError, Result},
    intake::IncomingFile,
    services::progress::{BatchProgressUpdate, ProgressReporter, ProgressSink},
    session::Session,
    types::{ProcessedOutput, ProcessingTimings, TaskError, TaskId},
};
use instant::Instant;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A batch item that produced a result
#[derive(Debug, Clone)]
pub struct BatchItemSuccess {
    pub task_id: TaskId,
    pub name: String,
    pub output: ProcessedOutput,
    pub timings: ProcessingTimings,
}

/// A batch item that failed
#[derive(Debug, Clone)]
pub struct BatchItemFailure {
    /// `None` when the item was rejected before a task existed
    pub task_id: Option<TaskId>,
    pub name: String,
    pub error: TaskError,
}

/// A batch item that was never run because the batch stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedItem {
    pub task_id: TaskId,
    pub name: String,
}

/// Outcome of a batch run
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub succeeded: Vec<BatchItemSuccess>,
    pub failed: Vec<BatchItemFailure>,
    pub aborted: Vec<AbortedItem>,
    /// Why the remaining items were not run
    pub abort_reason: Option<TaskError>,
    pub elapsed: Duration,
}

impl BatchReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.aborted.len()
    }

    /// Whether at least one item was submitted and none succeeded
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.total() > 0 && self.succeeded.is_empty()
    }

    /// Failures that may succeed when retried
    pub fn retryable(&self) -> impl Iterator<Item = &BatchItemFailure> {
        self.failed.iter().filter(|failure| failure.error.retryable)
    }

    /// One-line human-readable summary
    #[must_use]
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} of {} images processed, {} failed",
            self.succeeded.len(),
            self.total(),
            self.failed.len()
        );
        if !self.aborted.is_empty() {
            let _ = write!(summary, ", {} not started", self.aborted.len());
        }
        if let Some(reason) = &self.abort_reason {
            let _ = write!(summary, " ({})", reason.reason);
        }
        let _ = write!(summary, " in {:.1}s", self.elapsed.as_secs_f64());
        summary
    }
}

/// Outcome of one item
enum ItemOutcome {
    Succeeded(BatchItemSuccess),
    Failed(BatchItemFailure, bool),
    Aborted(AbortedItem),
}

/// Aggregates outcomes and reports batch progress
struct Tally<'a> {
    report: BatchReport,
    total: usize,
    started: Instant,
    reporter: Option<&'a dyn ProgressReporter>,
}

impl Tally<'_> {
    fn finished(&self) -> usize {
        self.report.total()
    }

    fn record(&mut self, outcome: ItemOutcome) {
        let name = match outcome {
            ItemOutcome::Succeeded(success) => {
                debug!(task = %success.task_id, "batch item succeeded");
                let name = success.name.clone();
                self.report.succeeded.push(success);
                name
            },
            ItemOutcome::Failed(failure, global) => {
                warn!(name = %failure.name, kind = %failure.error.kind, "batch item failed: {}", failure.error.detail);
                if global && self.report.abort_reason.is_none() {
                    self.report.abort_reason = Some(failure.error.clone());
                }
                let name = failure.name.clone();
                self.report.failed.push(failure);
                name
            },
            ItemOutcome::Aborted(item) => {
                let name = item.name.clone();
                self.report.aborted.push(item);
                name
            },
        };
        self.emit(Some(name));
    }

    fn emit(&self, current_item: Option<String>) {
        let Some(reporter) = self.reporter else {
            return;
        };
        let finished = self.finished();
        let percentage = if self.total == 0 {
            100
        } else {
            (finished * 100 / self.total) as u8
        };
        let eta_seconds = (finished > 0 && finished < self.total).then(|| {
            let per_item = self.started.elapsed().as_secs_f64() / finished as f64;
            (per_item * (self.total - finished) as f64).ceil() as u64
        });

        reporter.report_batch_progress(BatchProgressUpdate {
            finished,
            total: self.total,
            succeeded: self.report.succeeded.len(),
            failed: self.report.failed.len(),
            percentage,
            current_item,
            eta_seconds,
        });
    }
}

/// Runs multi-image uploads against a session
pub struct BatchScheduler {
    session: Arc<Session>,
    constraints: BatchConstraints,
    reporter: Option<Arc<dyn ProgressReporter>>,
    task_progress: Option<ProgressSink>,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("constraints", &self.constraints)
            .field("has_reporter", &self.reporter.is_some())
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    /// Scheduler using the session's batch constraints
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        let constraints = session.config().batch.clone();
        Self::with_constraints(session, constraints)
    }

    #[must_use]
    pub fn with_constraints(session: Arc<Session>, constraints: BatchConstraints) -> Self {
        Self {
            session,
            constraints: BatchConstraints {
                batch_size: constraints.batch_size.max(1),
                max_concurrent: constraints.max_concurrent.max(1),
            },
            reporter: None,
            task_progress: None,
        }
    }

    /// Receive a [`BatchProgressUpdate`] after every finished item
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Stream per-task progress of every item into `sink`
    #[must_use]
    pub fn with_task_progress(mut self, sink: ProgressSink) -> Self {
        self.task_progress = Some(sink);
        self
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Add `files` to the session and process them
    ///
    /// Never fails as a whole; every item ends up in exactly one of the
    /// report's lists.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn run(&self, files: Vec<IncomingFile>, cancel: &CancellationToken) -> BatchReport {
        let names: Vec<String> = files.iter().map(|file| file.name.clone()).collect();
        let mut tally = Tally {
            report: BatchReport::default(),
            total: files.len(),
            started: Instant::now(),
            reporter: self.reporter.as_deref(),
        };

        let mut accepted = Vec::with_capacity(files.len());
        for (name, result) in names.into_iter().zip(self.session.add_batch(files)) {
            match result {
                Ok(task_id) => accepted.push((task_id, name)),
                Err(error) => tally.record(ItemOutcome::Failed(
                    BatchItemFailure {
                        task_id: None,
                        name,
                        error: TaskError::from(&error),
                    },
                    false,
                )),
            }
        }

        let batch_count = (accepted.len() + self.constraints.batch_size - 1) / self.constraints.batch_size;
        info!(
            accepted = accepted.len(),
            batches = batch_count,
            batch_size = self.constraints.batch_size,
            max_concurrent = self.constraints.max_concurrent,
            "starting batch run"
        );

        for (index, batch) in accepted.chunks(self.constraints.batch_size).enumerate() {
            if cancel.is_cancelled() && tally.report.abort_reason.is_none() {
                tally.report.abort_reason = Some(TaskError::from(&PipelineError::cancelled("batch cancelled")));
            }
            if tally.report.abort_reason.is_some() {
                for (task_id, name) in batch {
                    tally.record(ItemOutcome::Aborted(AbortedItem {
                        task_id: *task_id,
                        name: name.clone(),
                    }));
                }
                continue;
            }

            debug!(batch = index + 1, of = batch_count, items = batch.len(), "running batch");
            self.run_batch(batch, cancel, &mut tally).await;
        }

        if cancel.is_cancelled() && tally.report.abort_reason.is_none() && !tally.report.aborted.is_empty() {
            tally.report.abort_reason = Some(TaskError::from(&PipelineError::cancelled("batch cancelled")));
        }
        tally.report.elapsed = tally.started.elapsed();
        info!("{}", tally.report.summary());
        tally.report
    }

    async fn run_batch(&self, batch: &[(TaskId, String)], cancel: &CancellationToken, tally: &mut Tally<'_>) {
        let semaphore = Arc::new(Semaphore::new(self.constraints.max_concurrent));

        // Normalize every item first so previews appear together
        let mut preparing = JoinSet::new();
        let mut owners = Owners::new();
        for (task_id, name) in batch.iter().cloned() {
            let session = Arc::clone(&self.session);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let handle = preparing.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(_permit) => session.prepare_cancellable(task_id, &cancel).await,
                    Err(_) => Err(PipelineError::internal("batch semaphore closed")),
                }
            });
            owners.insert(handle.id(), (task_id, name));
        }

        let mut prepared = Vec::with_capacity(batch.len());
        while let Some(joined) = preparing.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    let Some((task_id, name)) = owners.remove(&id) else { continue };
                    match result {
                        Ok(()) => prepared.push((task_id, name)),
                        Err(error) => tally.record(failure_outcome(task_id, name, &error)),
                    }
                }
                Err(join_error) => {
                    if let Some(outcome) = lost_worker(&mut owners, &join_error, "normalization") {
                        tally.record(outcome);
                    }
                }
            }
        }
        // Keep upload order for processing
        prepared.sort_by_key(|(task_id, _)| *task_id);

        let mut processing = JoinSet::new();
        for (task_id, name) in prepared {
            let session = Arc::clone(&self.session);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let sink = self.task_progress.clone();
            let handle = processing.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(_permit) => process_item(&session, task_id, sink, &cancel).await,
                    Err(_) => Err(PipelineError::internal("batch semaphore closed")),
                }
            });
            owners.insert(handle.id(), (task_id, name));
        }

        while let Some(joined) = processing.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    let Some((task_id, name)) = owners.remove(&id) else { continue };
                    match result {
                        Ok((output, timings)) => tally.record(ItemOutcome::Succeeded(BatchItemSuccess {
                            task_id,
                            name,
                            output,
                            timings,
                        })),
                        Err(error) => tally.record(failure_outcome(task_id, name, &error)),
                    }
                }
                Err(join_error) => {
                    if let Some(outcome) = lost_worker(&mut owners, &join_error, "processing") {
                        tally.record(outcome);
                    }
                }
            }
        }
    }
}

/// Batch items whose worker has not been joined yet
type Owners = HashMap<tokio::task::Id, (TaskId, String)>;

/// Outcome for an item whose worker panicked or was aborted
fn lost_worker(owners: &mut Owners, join_error: &JoinError, stage: &str) -> Option<ItemOutcome> {
    let (task_id, name) = owners.remove(&join_error.id())?;
    warn!(task = %task_id, "{stage} worker failed: {join_error}");
    let error = if join_error.is_cancelled() {
        PipelineError::cancelled(format!("{stage} worker aborted"))
    } else {
        PipelineError::internal(format!("{stage} worker failed: {join_error}"))
    };
    Some(failure_outcome(task_id, name, &error))
}

async fn process_item(
    session: &Session,
    task_id: TaskId,
    sink: Option<ProgressSink>,
    cancel: &CancellationToken,
) -> Result<(ProcessedOutput, ProcessingTimings)> {
    let output = session.process_cancellable(task_id, sink, cancel).await?;
    let timings = session.timings(task_id).await?;
    Ok((output, timings))
}

fn failure_outcome(task_id: TaskId, name: String, error: &PipelineError) -> ItemOutcome {
    if error.kind() == ErrorKind::Cancelled {
        return ItemOutcome::Aborted(AbortedItem { task_id, name });
    }
    ItemOutcome::Failed(
        BatchItemFailure {
            task_id: Some(task_id),
            name,
            error: TaskError::from(error),
        },
        error.is_global(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{MockBackendFactory, MockBehavior};
    use crate::config::PipelineConfig;
    use crate::intake::{FetchedImage, ImageFetcher};
    use crate::services::progress::{NoOpProgressReporter, ProgressUpdate};
    use crate::types::TaskStatus;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use reqwest::Url;
    use std::io::Cursor;
    use std::sync::Mutex;

    struct NoFetch;

    #[async_trait]
    impl ImageFetcher for NoFetch {
        async fn fetch(&self, url: &Url, _max_bytes: usize) -> Result<FetchedImage> {
            Err(PipelineError::fetch(format!("offline: {url}")))
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        updates: Mutex<Vec<BatchProgressUpdate>>,
    }

    impl ProgressReporter for RecordingReporter {
        fn report_progress(&self, _update: ProgressUpdate) {}
        fn report_completion(&self, _task_id: TaskId, _timings: &ProcessingTimings) {}
        fn report_error(&self, _task_id: TaskId, _error: &str) {}
        fn report_batch_progress(&self, update: BatchProgressUpdate) {
            self.updates.lock().unwrap().push(update);
        }
    }

    fn png(index: u8) -> IncomingFile {
        let image = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8, y as u8, index.wrapping_mul(37)]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        IncomingFile::new(format!("image-{index}.png"), "image/png", bytes)
    }

    fn session(factory: MockBackendFactory, batch_size: usize, max_concurrent: usize) -> Arc<Session> {
        let config = PipelineConfig::builder()
            .batch_size(batch_size)
            .max_concurrent(max_concurrent)
            .retries(0, 1)
            .build()
            .unwrap();
        Arc::new(Session::with_components(config, Arc::new(factory), Arc::new(NoFetch)).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_items_succeed_and_progress_is_count_based() {
        let factory = MockBackendFactory::new();
        let counters = factory.counters();
        let reporter = Arc::new(RecordingReporter::default());
        let scheduler = BatchScheduler::new(session(factory, 2, 2)).with_reporter(reporter.clone());

        let report = scheduler.run((0..5).map(png).collect(), &CancellationToken::new()).await;

        assert_eq!(report.succeeded.len(), 5);
        assert!(report.failed.is_empty());
        assert!(!report.all_failed());
        assert_eq!(counters.peak_concurrent_inferences(), 1);

        let updates = reporter.updates.lock().unwrap();
        let finished: Vec<usize> = updates.iter().map(|u| u.finished).collect();
        assert_eq!(finished, vec![1, 2, 3, 4, 5]);
        assert_eq!(updates.last().unwrap().percentage, 100);
    }

    #[tokio::test]
    async fn test_invalid_members_fail_without_stopping_the_batch() {
        let scheduler = BatchScheduler::new(session(MockBackendFactory::new(), 5, 3));
        let files = vec![
            png(1),
            IncomingFile::new("notes.txt", "text/plain", b"plain text".to_vec()),
            png(2),
        ];

        let report = scheduler.run(files, &CancellationToken::new()).await;

        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        let failure = &report.failed[0];
        assert_eq!(failure.task_id, None);
        assert_eq!(failure.name, "notes.txt");
        assert_eq!(failure.error.kind, ErrorKind::InvalidType);
        assert!(report.abort_reason.is_none());
    }

    #[tokio::test]
    async fn test_model_load_failure_aborts_remaining_batches() {
        let scheduler = BatchScheduler::new(session(MockBackendFactory::failing_load(), 2, 1));

        let report = scheduler.run((0..6).map(png).collect(), &CancellationToken::new()).await;

        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.aborted.len(), 4);
        assert_eq!(report.abort_reason.as_ref().unwrap().kind, ErrorKind::ModelLoadFailed);
        assert!(report.all_failed());

        // Aborted tasks stay in the session untouched
        let aborted = report.aborted[0].task_id;
        let snapshot = scheduler.session().snapshot(aborted).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_batch_keeps_completed_results() {
        let scheduler = BatchScheduler::new(session(MockBackendFactory::new(), 1, 1));
        let cancel = CancellationToken::new();
        let files: Vec<_> = (0..3).map(png).collect();

        // Cancel once the first item has finished
        struct CancelAfterFirst(CancellationToken);
        impl ProgressReporter for CancelAfterFirst {
            fn report_progress(&self, _update: ProgressUpdate) {}
            fn report_completion(&self, _task_id: TaskId, _timings: &ProcessingTimings) {}
            fn report_error(&self, _task_id: TaskId, _error: &str) {}
            fn report_batch_progress(&self, _update: BatchProgressUpdate) {
                self.0.cancel();
            }
        }
        let scheduler = scheduler.with_reporter(Arc::new(CancelAfterFirst(cancel.clone())));

        let report = scheduler.run(files, &cancel).await;
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.aborted.len(), 2);
        assert_eq!(report.abort_reason.as_ref().unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_transient_failures_are_reported_as_retryable() {
        let factory = MockBackendFactory::with_behavior(MockBehavior {
            failing_inferences: 1,
            ..MockBehavior::default()
        });
        let scheduler = BatchScheduler::new(session(factory, 5, 1)).with_reporter(Arc::new(NoOpProgressReporter));

        let report = scheduler.run(vec![png(1), png(2)], &CancellationToken::new()).await;

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.retryable().count(), 1);
        let failed = report.failed[0].task_id.unwrap();

        // The failed item can be retried on its own
        scheduler.session().retry(failed).await.unwrap();
        scheduler.session().process(failed, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_panicked_worker_is_reported_as_failed() {
        let mut workers = JoinSet::new();
        let mut owners = Owners::new();
        let handle = workers.spawn(async { panic!("decoder blew up") });
        owners.insert(handle.id(), (TaskId(7), "broken.png".to_string()));

        let join_error = workers.join_next().await.unwrap().unwrap_err();
        let outcome = lost_worker(&mut owners, &join_error, "normalization").unwrap();

        let ItemOutcome::Failed(failure, global) = outcome else {
            panic!("expected a failure outcome");
        };
        assert_eq!(failure.task_id, Some(TaskId(7)));
        assert_eq!(failure.name, "broken.png");
        assert_eq!(failure.error.kind, ErrorKind::Internal);
        assert!(!global);
        assert!(owners.is_empty());

        let mut tally = Tally {
            report: BatchReport::default(),
            total: 1,
            started: Instant::now(),
            reporter: None,
        };
        tally.record(ItemOutcome::Failed(failure, global));
        assert_eq!(tally.report.total(), 1);
        assert_eq!(tally.report.failed.len(), 1);
    }

    #[test]
    fn test_summary_mentions_abort_reason() {
        let report = BatchReport {
            abort_reason: Some(TaskError::from(&PipelineError::model("missing file"))),
            aborted: vec![AbortedItem {
                task_id: TaskId(3),
                name: "c.png".to_string(),
            }],
            elapsed: Duration::from_millis(1500),
            ..BatchReport::default()
        };
        let summary = report.summary();
        assert!(summary.contains("1 not started"));
        assert!(summary.contains("model could not be loaded"));
        assert!(report.all_failed());
    }
}
