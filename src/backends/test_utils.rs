//! Test utilities and mock backends
//!
//! Mock implementations of [`InferenceBackend`] and [`BackendFactory`] that
//! need no model file. Counters and call history are shared between a
//! factory and every backend it creates, so tests can observe model loads and
//! inferences across idle evictions.

use crate::{
    config::{BackendType, ProcessingConstraints},
    error::{PipelineError, Result},
    inference::{BackendFactory, InferenceBackend, ModelInfo, PreprocessingConfig},
};
use instant::Duration;
use ndarray::Array4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Behavior knobs of the mock backend
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Side length of the square model input
    pub input_size: u32,
    /// Number of initializations that fail before one succeeds
    /// (`usize::MAX` fails forever)
    pub failing_loads: usize,
    /// Number of inferences that fail before one succeeds
    pub failing_inferences: usize,
    /// Time spent inside each inference call
    pub inference_delay: Duration,
    /// Emit this value everywhere instead of the circular mask
    pub uniform_output: Option<f32>,
    /// Emit an output tensor with this shape instead of `1x1xSxS`
    pub output_shape_override: Option<(usize, usize, usize, usize)>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            input_size: 32,
            failing_loads: 0,
            failing_inferences: 0,
            inference_delay: Duration::ZERO,
            uniform_output: None,
            output_shape_override: None,
        }
    }
}

/// Counters shared by a factory and its backends
#[derive(Debug, Default)]
pub struct MockCounters {
    created: AtomicUsize,
    load_attempts: AtomicUsize,
    loads: AtomicUsize,
    inference_attempts: AtomicUsize,
    inferences: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl MockCounters {
    /// Backends created by the factory
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Successful model loads
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Initialization attempts, successful or not
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    /// Successful inferences
    pub fn inferences(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }

    /// Inference attempts, successful or not
    pub fn inference_attempts(&self) -> usize {
        self.inference_attempts.load(Ordering::SeqCst)
    }

    /// Highest number of inferences that ran at the same time
    pub fn peak_concurrent_inferences(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

/// Mock segmentation backend
#[derive(Debug)]
pub struct MockSegmentationBackend {
    initialized: bool,
    behavior: MockBehavior,
    counters: Arc<MockCounters>,
    call_history: Arc<Mutex<Vec<String>>>,
}

impl MockSegmentationBackend {
    /// Create a standalone mock backend with default behavior
    #[must_use]
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    #[must_use]
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            initialized: false,
            behavior,
            counters: Arc::new(MockCounters::default()),
            call_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get the call history for verification in tests
    pub fn get_call_history(&self) -> Vec<String> {
        self.call_history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    fn record_call(&self, method: &str) {
        if let Ok(mut history) = self.call_history.lock() {
            history.push(method.to_string());
        }
    }

    /// Circular mask with soft edges, centered on the tensor
    #[allow(clippy::cast_precision_loss)]
    fn generate_mock_output(&self, height: usize, width: usize) -> Array4<f32> {
        if let Some(value) = self.behavior.uniform_output {
            return Array4::from_elem((1, 1, height, width), value);
        }

        let center_x = width as f32 / 2.0;
        let center_y = height as f32 / 2.0;
        let radius = (width.min(height) as f32 / 3.0).max(1.0);

        Array4::from_shape_fn((1, 1, height, width), |(_, _, y, x)| {
            let dx = x as f32 + 0.5 - center_x;
            let dy = y as f32 + 0.5 - center_y;
            let distance = (dx * dx + dy * dy).sqrt();
            ((radius - distance) / radius).clamp(0.0, 1.0)
        })
    }
}

impl Default for MockSegmentationBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockSegmentationBackend {
    fn initialize(&mut self, _constraints: &ProcessingConstraints) -> Result<Option<Duration>> {
        self.record_call("initialize");
        if self.initialized {
            return Ok(None);
        }

        let attempt = self.counters.load_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.behavior.failing_loads {
            return Err(PipelineError::model("Mock model load failure"));
        }

        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.initialized = true;
        Ok(Some(Duration::from_millis(1)))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.record_call("infer");
        if !self.initialized {
            return Err(PipelineError::inference("Mock backend not initialized"));
        }

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_active.fetch_max(active, Ordering::SeqCst);
        if !self.behavior.inference_delay.is_zero() {
            std::thread::sleep(self.behavior.inference_delay);
        }
        self.counters.active.fetch_sub(1, Ordering::SeqCst);

        let attempt = self.counters.inference_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.behavior.failing_inferences {
            return Err(PipelineError::inference("Mock inference failure"));
        }

        let output = if let Some(shape) = self.behavior.output_shape_override {
            Array4::from_elem(shape, 0.5)
        } else {
            let shape = input.shape();
            self.generate_mock_output(shape[2], shape[3])
        };
        self.counters.inferences.fetch_add(1, Ordering::SeqCst);
        Ok(output)
    }

    fn preprocessing_config(&self) -> PreprocessingConfig {
        PreprocessingConfig::new(self.behavior.input_size, [0.5, 0.5, 0.5], [1.0, 1.0, 1.0])
    }

    fn model_info(&self) -> ModelInfo {
        let size = self.behavior.input_size as usize;
        ModelInfo {
            name: "mock-segmentation-model".to_string(),
            backend: "mock".to_string(),
            size_bytes: 1024,
            input_shape: (1, 3, size, size),
            output_shape: (1, 1, size, size),
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Factory producing mock backends that share counters
#[derive(Debug, Default)]
pub struct MockBackendFactory {
    behavior: MockBehavior,
    counters: Arc<MockCounters>,
    call_history: Arc<Mutex<Vec<String>>>,
}

impl MockBackendFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// Factory whose backends never load
    #[must_use]
    pub fn failing_load() -> Self {
        Self::with_behavior(MockBehavior {
            failing_loads: usize::MAX,
            ..MockBehavior::default()
        })
    }

    /// Factory whose first `count` inferences fail
    #[must_use]
    pub fn failing_inferences(count: usize) -> Self {
        Self::with_behavior(MockBehavior {
            failing_inferences: count,
            ..MockBehavior::default()
        })
    }

    /// Factory whose inferences take `delay`
    #[must_use]
    pub fn slow(delay: Duration) -> Self {
        Self::with_behavior(MockBehavior {
            inference_delay: delay,
            ..MockBehavior::default()
        })
    }

    /// Shared counters
    #[must_use]
    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    /// Calls made on every backend created so far
    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl BackendFactory for MockBackendFactory {
    fn create_backend(&self, _constraints: &ProcessingConstraints) -> Result<Box<dyn InferenceBackend>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSegmentationBackend {
            initialized: false,
            behavior: self.behavior.clone(),
            counters: Arc::clone(&self.counters),
            call_history: Arc::clone(&self.call_history),
        }))
    }

    fn available_backends(&self) -> Vec<BackendType> {
        vec![BackendType::Tract]
    }
}
