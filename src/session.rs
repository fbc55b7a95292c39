//! User session
//!
//! A session holds every image a user has added and exposes the per-image
//! actions: prepare, process, retry, replace, delete and download. Each task
//! sits behind its own async lock so distinct tasks progress independently,
//! while a second concurrent run of the same task is rejected.

use crate::{
    config::PipelineConfig,
    error::{PipelineError, Result},
    inference::{BackendFactory, DefaultBackendFactory},
    intake::{HttpFetcher, ImageFetcher, ImageIntake, IncomingFile},
    lifecycle::{LifecycleManager, ResourceOwner},
    processor::BackgroundRemovalProcessor,
    services::progress::{ProgressSink, TaskProgress},
    types::{
        processed_filename, Download, ImageSource, ImageTask, ProcessedOutput, ProcessingTimings, TaskId,
        TaskSnapshot,
    },
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Timeout for fetching remote images
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct TaskSlot {
    task: Arc<tokio::sync::Mutex<ImageTask>>,
    source: ImageSource,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

/// Marks a task as running for the lifetime of the guard
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn acquire(id: TaskId, flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PipelineError::invalid_state(format!("{id} is already being processed")))?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The set of images one user is working on
#[derive(Debug)]
pub struct Session {
    processor: Arc<BackgroundRemovalProcessor>,
    intake: ImageIntake,
    tasks: Mutex<BTreeMap<TaskId, TaskSlot>>,
    /// Parent of every task token; replaced on shutdown
    cancel: Mutex<CancellationToken>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Create a session with the default backend and HTTP fetcher
    ///
    /// # Errors
    /// - `InvalidConfig` when the configuration fails validation
    /// - `FetchFailed` when the HTTP client cannot be built
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(FETCH_TIMEOUT)?);
        Self::with_components(config, Arc::new(DefaultBackendFactory), fetcher)
    }

    /// Create a session with injected backend factory and fetcher
    ///
    /// # Errors
    /// - `InvalidConfig` when the configuration fails validation
    pub fn with_components(
        config: PipelineConfig,
        factory: Arc<dyn BackendFactory>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Self> {
        let lifecycle = Arc::new(LifecycleManager::new());
        let intake = ImageIntake::new(config.upload.clone(), Arc::clone(&lifecycle), fetcher);
        let processor = BackgroundRemovalProcessor::with_lifecycle(config, factory, lifecycle)?;

        Ok(Self {
            processor: Arc::new(processor),
            intake,
            tasks: Mutex::new(BTreeMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start cache sweeping and idle model release
    ///
    /// Must be called from within a tokio runtime. Calling it again has no
    /// effect.
    pub fn start_background_tasks(&self) {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if background.is_empty() {
            background.extend(self.processor.start_background_tasks());
        }
    }

    #[must_use]
    pub fn processor(&self) -> &Arc<BackgroundRemovalProcessor> {
        &self.processor
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        self.processor.lifecycle()
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        self.processor.config()
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<TaskId, TaskSlot>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: TaskId) -> Result<TaskSlot> {
        self.slots()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownTask(id.to_string()))
    }

    fn insert(&self, task: ImageTask) -> TaskId {
        let id = task.id;
        let slot = TaskSlot {
            source: task.source.clone(),
            task: Arc::new(tokio::sync::Mutex::new(task)),
            cancel: self.cancel.lock().unwrap_or_else(PoisonError::into_inner).child_token(),
            running: Arc::new(AtomicBool::new(false)),
        };
        self.slots().insert(id, slot);
        id
    }

    /// Add a single user-picked file
    ///
    /// # Errors
    /// - `InvalidType`, `TooLarge` or `InvalidInput` from validation
    pub fn add_file(&self, file: IncomingFile) -> Result<TaskId> {
        self.intake.accept_local(file).map(|task| self.insert(task))
    }

    /// Fetch a remote image and add it
    ///
    /// # Errors
    /// - `InvalidInput` for malformed URLs, `FetchFailed` for network errors
    /// - Any validation error of the fetched content
    pub async fn add_url(&self, url: &str) -> Result<TaskId> {
        let task = self.intake.accept_url(url).await?;
        Ok(self.insert(task))
    }

    /// Add the members of a multi-file upload; each is validated on its own
    pub fn add_batch(&self, files: Vec<IncomingFile>) -> Vec<Result<TaskId>> {
        self.intake
            .accept_batch(files)
            .into_iter()
            .map(|accepted| accepted.map(|task| self.insert(task)))
            .collect()
    }

    /// Ids of all tasks in insertion order
    #[must_use]
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.slots().keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Whether the task is currently running through the pipeline
    ///
    /// # Errors
    /// - `UnknownTask`
    pub fn is_running(&self, id: TaskId) -> Result<bool> {
        Ok(self.slot(id)?.running.load(Ordering::Acquire))
    }

    /// Produce the preview and processing renditions of a task
    ///
    /// # Errors
    /// - `UnknownTask`, `NormalizationFailed`, `Cancelled`
    pub async fn prepare(&self, id: TaskId) -> Result<()> {
        self.prepare_linked(id, None).await
    }

    /// [`prepare`](Self::prepare) that also stops when `cancel` fires
    ///
    /// # Errors
    /// - `UnknownTask`, `NormalizationFailed`, `Cancelled`
    pub async fn prepare_cancellable(&self, id: TaskId, cancel: &CancellationToken) -> Result<()> {
        self.prepare_linked(id, Some(cancel)).await
    }

    async fn prepare_linked(&self, id: TaskId, external: Option<&CancellationToken>) -> Result<()> {
        let slot = self.slot(id)?;
        let mut task = slot.task.lock().await;
        let token = slot.cancel.child_token();
        linked(&token, external, self.processor.prepare(&mut task, &token)).await
    }

    /// Run a task through the pipeline, optionally streaming progress
    ///
    /// # Errors
    /// - `UnknownTask`
    /// - `InvalidState` when the task is already running or not pending
    /// - Any pipeline stage error
    #[instrument(skip(self, sink), fields(task = %id))]
    pub async fn process(&self, id: TaskId, sink: Option<ProgressSink>) -> Result<ProcessedOutput> {
        self.process_linked(id, sink, None).await
    }

    /// [`process`](Self::process) that also stops when `cancel` fires
    ///
    /// The task observes the cancellation at its next stage boundary and
    /// ends up `Failed` with a `Cancelled` error.
    ///
    /// # Errors
    /// - Same as [`process`](Self::process)
    pub async fn process_cancellable(
        &self,
        id: TaskId,
        sink: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<ProcessedOutput> {
        self.process_linked(id, sink, Some(cancel)).await
    }

    async fn process_linked(
        &self,
        id: TaskId,
        sink: Option<ProgressSink>,
        external: Option<&CancellationToken>,
    ) -> Result<ProcessedOutput> {
        let slot = self.slot(id)?;
        let _running = RunGuard::acquire(id, &slot.running)?;
        let mut task = slot.task.lock().await;

        let token = slot.cancel.child_token();
        let progress = TaskProgress::new(
            id,
            task.attempt,
            sink,
            token.clone(),
            self.config().processing.soft_timeout(),
        );
        linked(&token, external, self.processor.process(&mut task, &progress)).await
    }

    /// Reset a finished task so it can be processed again
    ///
    /// References from the previous attempt are released; the normalized
    /// renditions are kept.
    ///
    /// # Errors
    /// - `UnknownTask`
    /// - `InvalidState` when the task is running, unfinished or out of retries
    pub async fn retry(&self, id: TaskId) -> Result<()> {
        let slot = self.slot(id)?;
        if slot.running.load(Ordering::Acquire) {
            return Err(PipelineError::invalid_state(format!("{id} is still being processed")));
        }
        let mut task = slot.task.lock().await;

        let limit = self.config().processing.max_task_retries;
        if task.retry_count >= limit {
            return Err(PipelineError::invalid_state(format!(
                "{id} reached the retry limit of {limit}"
            )));
        }
        task.reset_for_retry()?;
        let released = self.lifecycle().release_attempt(ResourceOwner::Task(id));
        debug!(task = %id, attempt = task.attempt, released, "task reset for retry");
        Ok(())
    }

    /// Remove a task, cancelling any work in flight
    ///
    /// Returns the number of references released. Work still running for the
    /// task stops at its next stage boundary and cannot register new
    /// references.
    ///
    /// # Errors
    /// - `UnknownTask`
    pub fn delete(&self, id: TaskId) -> Result<usize> {
        let slot = self
            .slots()
            .remove(&id)
            .ok_or_else(|| PipelineError::UnknownTask(id.to_string()))?;
        slot.cancel.cancel();
        let released = self.lifecycle().retire(ResourceOwner::Task(id));
        debug!(task = %id, released, "task deleted");
        Ok(released)
    }

    /// Replace a task's image with a new file
    ///
    /// The replacement is validated first; on failure the existing task is
    /// kept. On success the old task is deleted and the new one gets a fresh
    /// id, so late events of the old task cannot be mistaken for the new one.
    ///
    /// # Errors
    /// - `UnknownTask`
    /// - Any validation error of the replacement
    pub fn replace(&self, id: TaskId, file: IncomingFile) -> Result<TaskId> {
        let source = self.slot(id)?.source;
        let replacement = self.intake.accept(file, source)?;
        self.delete(id)?;
        Ok(self.insert(replacement))
    }

    /// Processed result of a completed task
    ///
    /// # Errors
    /// - `UnknownTask`
    /// - `InvalidState` when the task has no output
    pub async fn download(&self, id: TaskId) -> Result<Download> {
        let slot = self.slot(id)?;
        let task = slot.task.lock().await;
        let output = task
            .output
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_state(format!("{id} has no processed output")))?;

        Ok(Download {
            bytes: output.bytes.clone(),
            filename: processed_filename(&task.name, output.format),
            mime_type: output.format.mime_type(),
        })
    }

    /// Current view of a task; waits while a pipeline stage holds the task
    ///
    /// # Errors
    /// - `UnknownTask`
    pub async fn snapshot(&self, id: TaskId) -> Result<TaskSnapshot> {
        let slot = self.slot(id)?;
        let task = slot.task.lock().await;
        Ok(task.snapshot())
    }

    /// Timings of the task's latest attempt
    ///
    /// # Errors
    /// - `UnknownTask`
    pub async fn timings(&self, id: TaskId) -> Result<ProcessingTimings> {
        let slot = self.slot(id)?;
        let task = slot.task.lock().await;
        Ok(task.timings.clone())
    }

    /// Cancel all work and release every resource of the session
    ///
    /// Cached results are dropped and the model is released. The session
    /// holds no tasks afterwards and accepts new ones; their work runs under
    /// a fresh cancellation root and reloads the model on demand.
    pub async fn shutdown(&self) {
        let root = std::mem::take(&mut *self.cancel.lock().unwrap_or_else(PoisonError::into_inner));
        root.cancel();
        let slots: Vec<TaskSlot> = std::mem::take(&mut *self.slots()).into_values().collect();
        for handle in self.background.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            handle.abort();
        }

        self.processor.shutdown().await;
        let released = self.lifecycle().release_everything();
        info!(tasks = slots.len(), released, "session shut down");
    }
}

/// Drive `work` to completion, cancelling `token` when `external` fires
///
/// The work is never dropped early; it observes `token` at its own stage
/// boundaries and finishes with its own error.
async fn linked<F: Future>(token: &CancellationToken, external: Option<&CancellationToken>, work: F) -> F::Output {
    let Some(external) = external else {
        return work.await;
    };
    tokio::pin!(work);
    tokio::select! {
        output = &mut work => output,
        () = external.cancelled() => {
            token.cancel();
            work.await
        },
    }
}
