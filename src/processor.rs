//! Unified background removal processor
//!
//! This module provides the `BackgroundRemovalProcessor` that drives one task
//! through the pipeline: normalize, fingerprint, cache lookup, segment,
//! composite, cache store. It is shared by the session API, the batch
//! scheduler and the CLI so every surface behaves the same way.

use crate::{
    cache::{Fingerprint, ResultCache},
    compositor::Compositor,
    config::PipelineConfig,
    error::{ErrorKind, PipelineError, Result},
    inference::{BackendFactory, DefaultBackendFactory},
    lifecycle::{LifecycleManager, RefScope, ResourceOwner},
    normalize::{Normalizer, ProfileKind},
    segmentation::SegmentationEngine,
    services::progress::{ProcessingStage, TaskProgress},
    types::{CompositeImage, ImageTask, NormalizedImage, ProcessedOutput, TaskStatus},
    utils::retry::RetryPolicy,
};
use instant::Instant;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, span, warn, Instrument, Level};

/// Drives image tasks through the pipeline stages
#[derive(Debug)]
pub struct BackgroundRemovalProcessor {
    config: PipelineConfig,
    normalizer: Normalizer,
    engine: Arc<SegmentationEngine>,
    compositor: Compositor,
    cache: Arc<ResultCache>,
    lifecycle: Arc<LifecycleManager>,
    retry: RetryPolicy,
}

impl BackgroundRemovalProcessor {
    /// Create a processor with the default backend factory
    ///
    /// # Errors
    /// - `InvalidConfig` when the configuration fails validation
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(DefaultBackendFactory))
    }

    /// Create a processor with a custom backend factory
    ///
    /// # Errors
    /// - `InvalidConfig` when the configuration fails validation
    pub fn with_factory(config: PipelineConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        Self::with_lifecycle(config, factory, Arc::new(LifecycleManager::new()))
    }

    /// Create a processor sharing an existing lifecycle manager
    ///
    /// # Errors
    /// - `InvalidConfig` when the configuration fails validation
    pub fn with_lifecycle(
        config: PipelineConfig,
        factory: Arc<dyn BackendFactory>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = if config.cache.enabled {
            ResultCache::new(config.cache.ttl(), Arc::clone(&lifecycle))
        } else {
            ResultCache::disabled(Arc::clone(&lifecycle))
        };

        Ok(Self {
            normalizer: Normalizer::with_limit(config.normalization.clone(), config.batch.max_concurrent),
            engine: Arc::new(SegmentationEngine::new(factory, config.processing.clone())),
            compositor: Compositor::from_constraints(&config.processing),
            cache: Arc::new(cache),
            retry: RetryPolicy::from_constraints(&config.processing),
            lifecycle,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<SegmentationEngine> {
        &self.engine
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Start the cache sweeper and the idle-model reaper
    ///
    /// Both tasks stop on their own once the processor is dropped. Must be
    /// called from within a tokio runtime.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);
        if self.cache.is_enabled() {
            let period = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
            handles.push(self.cache.spawn_sweeper(period));
        }
        let idle = self.config.processing.model_idle_timeout();
        let period = (idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        handles.push(self.engine.spawn_idle_reaper(period));
        handles
    }

    /// Produce the preview and processing renditions of a task
    ///
    /// Already normalized tasks are left untouched. A pending task moves to
    /// `Normalizing`; a failure moves it to `Failed`.
    ///
    /// # Errors
    /// - `NormalizationFailed` when either rendition cannot be produced
    /// - `Cancelled` when `cancel` fires first or the task was released
    #[instrument(skip_all, fields(task = %task.id))]
    pub async fn prepare(&self, task: &mut ImageTask, cancel: &CancellationToken) -> Result<()> {
        let result = self.prepare_inner(task, cancel, None).await;
        if let Err(error) = &result {
            task.fail(error);
        }
        result
    }

    async fn prepare_inner(
        &self,
        task: &mut ImageTask,
        cancel: &CancellationToken,
        progress: Option<&TaskProgress>,
    ) -> Result<()> {
        if task.status() == TaskStatus::Pending {
            task.transition(TaskStatus::Normalizing)?;
        }
        if task.normalized.is_some() && task.preview.is_some() {
            return Ok(());
        }
        ensure_not_cancelled(cancel, "before normalization")?;
        if let Some(progress) = progress {
            progress.stage(ProcessingStage::Normalizing);
        }

        let started = Instant::now();
        let (preview, processing) = tokio::join!(
            self.normalizer.normalize(Arc::clone(&task.original), ProfileKind::Preview),
            self.normalizer.normalize(Arc::clone(&task.original), ProfileKind::Processing),
        );
        let (preview, processing) = (preview?, processing?);
        ensure_not_cancelled(cancel, "after normalization")?;

        let preview_url = self.lifecycle.allocate(
            ResourceOwner::Task(task.id),
            RefScope::Owner,
            Arc::new(preview.bytes.clone()),
        )?;
        task.fingerprint = Some(Fingerprint::of(&processing.bytes));
        task.preview_url = Some(preview_url);
        task.preview = Some(preview);
        task.normalized = Some(processing);
        task.timings.normalize_ms = started.elapsed().as_millis() as u64;

        debug!(
            "{}: normalized {}x{} -> {:?} in {}ms",
            task.id,
            task.normalized.as_ref().map_or(0, |n| n.source_dimensions.0),
            task.normalized.as_ref().map_or(0, |n| n.source_dimensions.1),
            task.normalized.as_ref().map(NormalizedImage::dimensions),
            task.timings.normalize_ms
        );
        Ok(())
    }

    /// Run a task through the whole pipeline
    ///
    /// A cache hit completes the task without touching the segmentation
    /// engine. On failure the task moves to `Failed` with a classified
    /// error. Cancellation is observed between stages; a result that
    /// arrives after cancellation is dropped.
    ///
    /// # Errors
    /// - `InvalidState` when the task is not pending (retry it first)
    /// - Any stage error: `NormalizationFailed`, `ModelLoadFailed`,
    ///   `InferenceFailed`, `InvalidInput`, `CompositeFailed`, `Cancelled`
    #[instrument(skip_all, fields(task = %task.id, attempt = task.attempt))]
    pub async fn process(&self, task: &mut ImageTask, progress: &TaskProgress) -> Result<ProcessedOutput> {
        let started = Instant::now();
        let result = self.run_stages(task, progress).await;
        task.timings.total_ms = started.elapsed().as_millis() as u64;
        task.set_progress(progress.percentage());

        match result {
            Ok(output) => {
                info!(
                    "{} completed in {}ms{}",
                    task.id,
                    task.timings.total_ms,
                    if task.timings.cache_hit { " (cache hit)" } else { "" }
                );
                Ok(output)
            },
            Err(error) => {
                if error.kind() == ErrorKind::Cancelled {
                    debug!("{} cancelled: {}", task.id, error);
                } else {
                    warn!(task = %task.id, kind = ?error.kind(), "processing failed: {error}");
                }
                task.fail(&error);
                Err(error)
            },
        }
    }

    async fn run_stages(&self, task: &mut ImageTask, progress: &TaskProgress) -> Result<ProcessedOutput> {
        let cancel = progress.cancellation().clone();
        match task.status() {
            TaskStatus::Pending | TaskStatus::Normalizing => {},
            status => {
                return Err(PipelineError::invalid_state(format!(
                    "{} is {status}; only pending tasks can be processed",
                    task.id
                )))
            },
        }

        self.prepare_inner(task, &cancel, Some(progress)).await?;
        task.set_progress(progress.percentage());
        let normalized = task
            .normalized
            .clone()
            .ok_or_else(|| PipelineError::internal("normalized rendition missing after normalization"))?;
        let fingerprint = task
            .fingerprint
            .ok_or_else(|| PipelineError::internal("fingerprint missing after normalization"))?;

        progress.stage(ProcessingStage::CacheLookup);
        match self.cache.get(&fingerprint) {
            Ok(Some(hit)) => {
                debug!("{}: cache hit for {} (age {:?})", task.id, fingerprint.short(), hit.age);
                task.timings.cache_hit = true;
                return self.complete(task, (*hit.image).clone(), fingerprint, true, progress);
            },
            Ok(None) => {},
            Err(error) => warn!("cache lookup bypassed: {error}"),
        }

        ensure_not_cancelled(&cancel, "before segmentation")?;
        task.transition(TaskStatus::Segmenting)?;
        let segment_started = Instant::now();
        let outcome = {
            let normalized = &normalized;
            let engine: &SegmentationEngine = &self.engine;
            self.retry
                .execute(&cancel, move |_| engine.segment_detailed(normalized, progress))
                .instrument(span!(Level::DEBUG, "segment", fingerprint = %fingerprint.short()))
                .await
        };
        task.timings.segmentation_attempts = outcome.attempts;
        task.timings.segment_ms = segment_started.elapsed().as_millis() as u64;
        let segmentation = outcome.result?;
        task.timings.model_load_ms = segmentation.model_load.map_or(0, |d| d.as_millis() as u64);
        task.set_progress(progress.percentage());

        ensure_not_cancelled(&cancel, "segmentation result dropped")?;
        task.transition(TaskStatus::Compositing)?;
        let composite_started = Instant::now();
        let composite = self
            .compositor
            .composite(&normalized, &segmentation.mask, progress)
            .await?;
        task.timings.composite_ms = composite_started.elapsed().as_millis() as u64;
        task.mask = Some(segmentation.mask);

        progress.stage(ProcessingStage::Caching);
        if let Err(error) = self.cache.put(fingerprint, &composite) {
            warn!("cache store bypassed: {error}");
        }

        self.complete(task, composite, fingerprint, false, progress)
    }

    /// Register the output reference and move the task to `Completed`
    fn complete(
        &self,
        task: &mut ImageTask,
        composite: CompositeImage,
        fingerprint: Fingerprint,
        from_cache: bool,
        progress: &TaskProgress,
    ) -> Result<ProcessedOutput> {
        ensure_not_cancelled(progress.cancellation(), "result dropped")?;

        let url = self.lifecycle.allocate(
            ResourceOwner::Task(task.id),
            RefScope::Attempt,
            Arc::new(composite.bytes.clone()),
        )?;
        let mut output = ProcessedOutput::from_composite(composite, fingerprint, from_cache);
        output.url = Some(url);

        task.transition(TaskStatus::Completed)?;
        task.output = Some(output.clone());
        progress.stage(ProcessingStage::Completed);
        Ok(output)
    }

    /// Drop cached results and release the model
    pub async fn shutdown(&self) {
        match self.cache.clear() {
            Ok(cleared) => debug!("cleared {cleared} cache entries"),
            Err(error) => warn!("cache clear skipped: {error}"),
        }
        self.engine.shutdown().await;
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken, stage: &str) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::cancelled(format!("cancelled {stage}")))
    } else {
        Ok(())
    }
}
