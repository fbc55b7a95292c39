//! Segmentation engine
//!
//! Owns the segmentation model for a session. The model is created on first
//! use, reused while work keeps arriving and released after a period of
//! inactivity. Every segmentation in the process queues behind a single
//! async lock, so at most one inference runs at a time no matter how many
//! tasks are in flight.

use crate::{
    config::ProcessingConstraints,
    error::{PipelineError, Result},
    inference::{BackendFactory, InferenceBackend},
    services::progress::{ProcessingStage, TaskProgress},
    types::{NormalizedImage, SegmentationMask},
    utils::{
        preprocessing::{ImagePreprocessor, MaskExtractor},
        yielding::YieldingWorkLoop,
    },
};
use ndarray::Array4;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Interval between estimated progress reports during inference
const INFERENCE_TICK: Duration = Duration::from_millis(100);
/// Inference duration assumed before the first measurement
const INITIAL_INFERENCE_ESTIMATE_MS: u64 = 2_000;
/// Estimated inference progress never claims more than this fraction
const MAX_ESTIMATED_FRACTION: f32 = 0.95;

/// Externally visible engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// No model loaded
    Cold,
    /// Model loaded and ready
    Warm,
    /// Model failed to load; calls fail until `reset`
    Failed(String),
}

/// Engine activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Calls to `segment`
    pub invocations: u64,
    /// Successful model loads
    pub model_loads: u64,
    /// Models released for inactivity
    pub evictions: u64,
    /// Segmentations currently holding the model
    pub in_flight: usize,
    /// Highest number of segmentations observed holding the model at once
    pub peak_in_flight: usize,
}

/// Mask plus timing details of one segmentation
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub mask: SegmentationMask,
    /// Model load time when this call had to create the model
    pub model_load: Option<Duration>,
    /// Preprocessing plus inference time
    pub inference: Duration,
}

enum EngineState {
    Cold,
    Warm {
        backend: Box<dyn InferenceBackend>,
        last_used: Instant,
    },
    Failed(String),
}

#[derive(Debug, Default)]
struct Counters {
    invocations: AtomicU64,
    model_loads: AtomicU64,
    evictions: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a Counters);

impl<'a> InFlightGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Lazily created, globally serialized segmentation model
pub struct SegmentationEngine {
    factory: Arc<dyn BackendFactory>,
    constraints: ProcessingConstraints,
    state: Mutex<EngineState>,
    /// Load failure visible without waiting for the state lock
    failure: RwLock<Option<String>>,
    counters: Counters,
    inference_estimate_ms: AtomicU64,
}

impl std::fmt::Debug for SegmentationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationEngine")
            .field("model", &self.constraints.model_name)
            .field("backend", &self.constraints.backend)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SegmentationEngine {
    #[must_use]
    pub fn new(factory: Arc<dyn BackendFactory>, constraints: ProcessingConstraints) -> Self {
        Self {
            factory,
            constraints,
            state: Mutex::new(EngineState::Cold),
            failure: RwLock::new(None),
            counters: Counters::default(),
            inference_estimate_ms: AtomicU64::new(INITIAL_INFERENCE_ESTIMATE_MS),
        }
    }

    #[must_use]
    pub fn constraints(&self) -> &ProcessingConstraints {
        &self.constraints
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            invocations: self.counters.invocations.load(Ordering::SeqCst),
            model_loads: self.counters.model_loads.load(Ordering::SeqCst),
            evictions: self.counters.evictions.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Current state; waits for a running segmentation to finish
    pub async fn status(&self) -> EngineStatus {
        match &*self.state.lock().await {
            EngineState::Cold => EngineStatus::Cold,
            EngineState::Warm { .. } => EngineStatus::Warm,
            EngineState::Failed(reason) => EngineStatus::Failed(reason.clone()),
        }
    }

    fn recorded_failure(&self) -> Option<String> {
        self.failure.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record_failure(&self, reason: Option<String>) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = reason;
    }

    /// Segment a normalized image
    ///
    /// # Errors
    /// - `ModelLoadFailed` when the model cannot be created, and for every
    ///   call after that until [`reset`](Self::reset)
    /// - `InferenceFailed` for transient backend failures
    /// - `InvalidInput` for undecodable input or an unexpected output shape
    /// - `Cancelled` when the task is cancelled while waiting
    pub async fn segment(&self, image: &NormalizedImage, progress: &TaskProgress) -> Result<SegmentationMask> {
        self.segment_detailed(image, progress).await.map(|s| s.mask)
    }

    /// Segment a normalized image and report timings
    ///
    /// # Errors
    /// See [`segment`](Self::segment).
    #[instrument(skip_all, fields(task = %progress.task_id(), width = image.width, height = image.height))]
    pub async fn segment_detailed(&self, image: &NormalizedImage, progress: &TaskProgress) -> Result<Segmentation> {
        self.counters.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.recorded_failure() {
            return Err(PipelineError::model(reason));
        }

        let mut state = tokio::select! {
            guard = self.state.lock() => guard,
            () = progress.cancellation().cancelled() => {
                return Err(PipelineError::cancelled("cancelled while waiting for the model"));
            },
        };
        let _in_flight = InFlightGuard::enter(&self.counters);

        let (backend, model_load) = match std::mem::replace(&mut *state, EngineState::Cold) {
            EngineState::Failed(reason) => {
                *state = EngineState::Failed(reason.clone());
                return Err(PipelineError::model(reason));
            },
            EngineState::Warm { backend, .. } => (backend, None),
            EngineState::Cold => {
                progress.stage(ProcessingStage::ModelLoading);
                match self.load_backend().await {
                    Ok((backend, load_time)) => (backend, Some(load_time)),
                    Err(error) => {
                        warn!("segmentation model unavailable: {error}");
                        *state = EngineState::Failed(error.to_string());
                        self.record_failure(Some(error.to_string()));
                        return Err(error);
                    },
                }
            },
        };

        if progress.is_cancelled() {
            *state = EngineState::Warm {
                backend,
                last_used: Instant::now(),
            };
            return Err(PipelineError::cancelled("cancelled before inference"));
        }

        progress.stage(ProcessingStage::Preprocessing);
        let started = Instant::now();
        let (backend, output) = self.run_inference(backend, image, progress).await?;
        let inference = started.elapsed();
        *state = EngineState::Warm {
            backend,
            last_used: Instant::now(),
        };
        drop(state);

        let output = output?;
        self.update_estimate(inference);

        let mask = self.extract_mask(&output, image.dimensions(), progress).await?;
        debug!(
            inference_ms = inference.as_millis() as u64,
            foreground_ratio = mask.statistics().foreground_ratio,
            "segmentation complete"
        );
        Ok(Segmentation {
            mask,
            model_load,
            inference,
        })
    }

    /// Create and initialize a backend on a blocking worker
    async fn load_backend(&self) -> Result<(Box<dyn InferenceBackend>, Duration)> {
        let mut backend = self.factory.create_backend(&self.constraints).map_err(as_model_error)?;
        let constraints = self.constraints.clone();
        let started = Instant::now();

        let (backend, result) = tokio::task::spawn_blocking(move || {
            let result = backend.initialize(&constraints);
            (backend, result)
        })
        .await
        .map_err(|e| PipelineError::model(format!("Model loading worker failed: {e}")))?;
        result.map_err(as_model_error)?;

        let load_time = started.elapsed();
        self.counters.model_loads.fetch_add(1, Ordering::SeqCst);
        info!(
            model = %self.constraints.model_name,
            load_ms = load_time.as_millis() as u64,
            "segmentation model loaded"
        );
        Ok((backend, load_time))
    }

    /// Preprocess and infer on a blocking worker, reporting estimated progress
    ///
    /// The backend always comes back unless the worker panicked, in which case
    /// the engine returns to `Cold`.
    async fn run_inference(
        &self,
        mut backend: Box<dyn InferenceBackend>,
        image: &NormalizedImage,
        progress: &TaskProgress,
    ) -> Result<(Box<dyn InferenceBackend>, Result<Array4<f32>>)> {
        let image = image.clone();
        let mut worker = tokio::task::spawn_blocking(move || {
            let output = image.decode().and_then(|decoded| {
                let config = backend.preprocessing_config();
                let (tensor, _) = ImagePreprocessor::preprocess(&decoded, &config)?;
                backend.infer(&tensor)
            });
            (backend, output)
        });

        let started = Instant::now();
        let estimate = Duration::from_millis(self.inference_estimate_ms.load(Ordering::Relaxed).max(1));
        let mut ticker = tokio::time::interval(INFERENCE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut worker => {
                    return joined.map_err(|e| {
                        PipelineError::inference(format!("Inference worker failed: {e}"))
                    });
                },
                _ = ticker.tick() => {
                    let fraction = (started.elapsed().as_secs_f32() / estimate.as_secs_f32())
                        .min(MAX_ESTIMATED_FRACTION);
                    progress.report_fraction(ProcessingStage::Inference, fraction);
                },
            }
        }
    }

    /// Map the output tensor onto the image grid in yielding chunks
    async fn extract_mask(
        &self,
        output: &Array4<f32>,
        dimensions: (u32, u32),
        progress: &TaskProgress,
    ) -> Result<SegmentationMask> {
        progress.stage(ProcessingStage::MaskGeneration);
        let extractor = MaskExtractor::new(output, dimensions)?;
        let (width, height) = dimensions;
        let rows_per_chunk = (self.constraints.composite_chunk_pixels / width.max(1) as usize).max(1);
        let mut data = Vec::with_capacity(width as usize * height as usize);

        YieldingWorkLoop::new(rows_per_chunk)
            .with_cancellation(progress.cancellation().clone())
            .run(height as usize, |rows| {
                extractor.extract_rows(rows.start as u32..rows.end as u32, &mut data);
                progress.report_fraction(ProcessingStage::MaskGeneration, rows.end as f32 / height as f32);
            })
            .await?;

        Ok(SegmentationMask::new(data, dimensions))
    }

    fn update_estimate(&self, measured: Duration) {
        let measured_ms = measured.as_millis() as u64;
        let previous = self.inference_estimate_ms.load(Ordering::Relaxed);
        // Weighted toward recent runs
        self.inference_estimate_ms
            .store((previous + 3 * measured_ms) / 4, Ordering::Relaxed);
    }

    /// Release the model if it has been idle for the configured timeout
    ///
    /// Returns `true` when a model was released. A busy engine is never idle.
    pub fn evict_if_idle(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        let idle_timeout = self.constraints.model_idle_timeout();
        let idle = matches!(&*state, EngineState::Warm { last_used, .. } if last_used.elapsed() >= idle_timeout);
        if idle {
            *state = EngineState::Cold;
            self.counters.evictions.fetch_add(1, Ordering::SeqCst);
            info!(idle_secs = idle_timeout.as_secs(), "released idle segmentation model");
        }
        idle
    }

    /// Periodically release an idle model until the engine is dropped
    pub fn spawn_idle_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = period.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.evict_if_idle();
            }
        })
    }

    /// Clear a load failure so the next call tries to create the model again
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if matches!(&*state, EngineState::Failed(_)) {
            *state = EngineState::Cold;
        }
        self.record_failure(None);
    }

    /// Release the model; the engine stays usable and reloads on demand
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if matches!(&*state, EngineState::Warm { .. }) {
            info!("segmentation model released on shutdown");
        }
        *state = EngineState::Cold;
        self.record_failure(None);
    }
}

fn as_model_error(error: PipelineError) -> PipelineError {
    match error {
        PipelineError::ModelLoadFailed(_) => error,
        other => PipelineError::model(other.to_string()),
    }
}
