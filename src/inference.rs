//! Inference backend abstraction and factory

use crate::{
    config::{BackendType, ProcessingConstraints},
    error::{PipelineError, Result},
};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

pub use crate::utils::preprocessing::PreprocessingConfig;

// Use instant crate for cross-platform time compatibility
use instant::Duration;

/// Static description of a loaded model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Backend running the model
    pub backend: String,
    /// Size of the model file in bytes, when known
    pub size_bytes: u64,
    pub input_shape: (usize, usize, usize, usize),
    pub output_shape: (usize, usize, usize, usize),
}

/// Trait for inference backends
///
/// Implementations are driven from a blocking worker thread, one call at a
/// time, so they only need to be `Send`.
pub trait InferenceBackend: Send {
    /// Load the model described by `constraints`
    ///
    /// Returns the load time on the first call and `None` when the backend
    /// was already initialized.
    ///
    /// # Errors
    /// - `ModelLoadFailed` when the model file is missing or invalid
    fn initialize(&mut self, constraints: &ProcessingConstraints) -> Result<Option<Duration>>;

    /// Run inference on a `1x3xSxS` input tensor
    ///
    /// # Errors
    /// - `InferenceFailed` for runtime failures
    /// - `InvalidInput` when the output cannot be shaped into `1x1xHxW`
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Tensor layout and normalization the model expects
    fn preprocessing_config(&self) -> PreprocessingConfig;

    /// Model description
    fn model_info(&self) -> ModelInfo;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;
}

/// Creates inference backends for the segmentation engine
pub trait BackendFactory: Send + Sync {
    /// Create an uninitialized backend for the configured backend type
    ///
    /// # Errors
    /// - `ModelLoadFailed` when the backend type is not compiled in
    fn create_backend(&self, constraints: &ProcessingConstraints) -> Result<Box<dyn InferenceBackend>>;

    /// List available backend types
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Factory over the backends enabled at compile time
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(&self, constraints: &ProcessingConstraints) -> Result<Box<dyn InferenceBackend>> {
        match constraints.backend {
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(crate::backends::TractBackend::new(constraints))),
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(crate::backends::OnnxBackend::new(constraints))),
            #[allow(unreachable_patterns)]
            other => Err(PipelineError::model(format!(
                "Backend {other:?} is not compiled into this build"
            ))),
        }
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        backends
    }
}

/// Reshape a dynamic-rank output into a `1x1xHxW` mask tensor
///
/// Accepts `[1, 1, H, W]`, `[1, H, W]` and `[H, W]` outputs.
///
/// # Errors
/// - `InvalidInput` for any other shape or a length mismatch
pub(crate) fn reshape_mask_output(shape: &[usize], data: Vec<f32>) -> Result<Array4<f32>> {
    let (height, width) = match shape {
        [1, 1, h, w] | [1, h, w] | [h, w] => (*h, *w),
        other => {
            return Err(PipelineError::invalid_input(format!(
                "Unexpected model output shape {other:?}, expected [1, 1, H, W]"
            )))
        },
    };
    Array4::from_shape_vec((1, 1, height, width), data)
        .map_err(|e| PipelineError::invalid_input(format!("Failed to reshape output tensor: {e}")))
}
