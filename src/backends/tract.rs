//! Tract backend implementation for segmentation models
//!
//! Tract is a pure Rust ONNX runtime with no native dependencies, which
//! makes it the default backend of the pipeline.

use crate::config::ProcessingConstraints;
use crate::error::{PipelineError, Result};
use crate::inference::{reshape_mask_output, InferenceBackend, ModelInfo, PreprocessingConfig};
use ndarray::Array4;
use std::path::PathBuf;
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

// Use instant crate for cross-platform time compatibility
use instant::{Duration, Instant};

/// Tract backend for running segmentation models using pure Rust inference
#[derive(Debug)]
pub struct TractBackend {
    model: Option<TractModel>,
    model_name: String,
    model_path: PathBuf,
    model_size: u64,
    preprocessing: PreprocessingConfig,
}

impl TractBackend {
    /// Create an uninitialized backend for the configured model
    #[must_use]
    pub fn new(constraints: &ProcessingConstraints) -> Self {
        Self {
            model: None,
            model_name: constraints.model_name.clone(),
            model_path: constraints.resolve_model_path(),
            model_size: 0,
            preprocessing: PreprocessingConfig::new(
                constraints.input_size,
                constraints.normalization_mean,
                constraints.normalization_std,
            ),
        }
    }

    /// Load and optimize the model using Tract
    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();

        let model_data = std::fs::read(&self.model_path).map_err(|e| {
            PipelineError::model(format!(
                "Failed to read model '{}': {e}",
                self.model_path.display()
            ))
        })?;
        self.model_size = model_data.len() as u64;

        log::info!("🚀 Initializing Tract backend");
        log::info!("🧠 Model: {} ({})", self.model_name, self.model_path.display());
        #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for logging display
        let size_mb = self.model_size as f64 / (1024.0 * 1024.0);
        log::info!("📏 Model size: {size_mb:.2} MB");

        let size = self.preprocessing.input_size as usize;
        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(model_data))
            .map_err(|e| PipelineError::model(format!("Failed to load ONNX model: {e}")))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .map_err(|e| PipelineError::model(format!("Failed to set input shape: {e}")))?
            .into_optimized()
            .map_err(|e| PipelineError::model(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| PipelineError::model(format!("Failed to create runnable model: {e}")))?;

        self.model = Some(model);

        let model_load_time = model_load_start.elapsed();
        log::info!("✅ Tract backend initialized in {}ms", model_load_time.as_millis());
        Ok(model_load_time)
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self, _constraints: &ProcessingConstraints) -> Result<Option<Duration>> {
        if self.model.is_some() {
            return Ok(None);
        }
        self.load_model().map(Some)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| PipelineError::inference("Tract model not initialized"))?;

        log::debug!("🔮 Running Tract inference on {:?}", input.shape());
        let inference_start = Instant::now();

        let input_tensor = Tensor::from(input.clone());
        let outputs = model
            .run(tvec![input_tensor.into()])
            .map_err(|e| PipelineError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::inference("No output tensor found"))?
            .into_arc_tensor();

        let output_view = output_tensor
            .to_array_view::<f32>()
            .map_err(|e| PipelineError::inference(format!("Failed to convert output tensor: {e}")))?;
        let shape = output_view.shape().to_vec();
        let output = reshape_mask_output(&shape, output_view.iter().copied().collect())?;

        log::debug!(
            "✅ Tract inference completed in {}ms, output {:?}",
            inference_start.elapsed().as_millis(),
            output.shape()
        );
        Ok(output)
    }

    fn preprocessing_config(&self) -> PreprocessingConfig {
        self.preprocessing.clone()
    }

    fn model_info(&self) -> ModelInfo {
        let size = self.preprocessing.input_size as usize;
        ModelInfo {
            name: self.model_name.clone(),
            backend: "tract".to_string(),
            size_bytes: self.model_size,
            input_shape: (1, 3, size, size),
            output_shape: (1, 1, size, size),
        }
    }

    fn is_initialized(&self) -> bool {
        self.model.is_some()
    }
}
