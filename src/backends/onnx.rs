//! ONNX Runtime backend implementation for segmentation models
//!
//! Uses ONNX Runtime with hardware execution providers (CUDA, `CoreML`) when
//! they are available and falls back to the CPU otherwise.

use crate::config::ProcessingConstraints;
use crate::error::{PipelineError, Result};
use crate::inference::{reshape_mask_output, InferenceBackend, ModelInfo, PreprocessingConfig};
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// ONNX Runtime backend for running segmentation models
#[derive(Debug)]
pub struct OnnxBackend {
    session: Option<Session>,
    model_name: String,
    model_path: PathBuf,
    model_size: u64,
    preprocessing: PreprocessingConfig,
}

impl OnnxBackend {
    /// List ONNX Runtime execution providers with their availability
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool)> {
        vec![
            ("CPU".to_string(), true),
            (
                "CUDA".to_string(),
                OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false),
            ),
            (
                "CoreML".to_string(),
                OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default()).unwrap_or(false),
            ),
        ]
    }

    /// Create an uninitialized backend for the configured model
    #[must_use]
    pub fn new(constraints: &ProcessingConstraints) -> Self {
        Self {
            session: None,
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

    /// Load the model and create the ONNX Runtime session
    fn load_model(&mut self, constraints: &ProcessingConstraints) -> Result<Duration> {
        let model_load_start = Instant::now();

        let model_data = std::fs::read(&self.model_path).map_err(|e| {
            PipelineError::model(format!(
                "Failed to read model '{}': {e}",
                self.model_path.display()
            ))
        })?;
        self.model_size = model_data.len() as u64;

        let mut session_builder = Session::builder()
            .map_err(|e| PipelineError::model(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::model(format!("Failed to set optimization level: {e}")))?;

        let mut providers = Vec::new();
        let cuda_provider = CUDAExecutionProvider::default();
        if OrtExecutionProvider::is_available(&cuda_provider).unwrap_or(false) {
            log::info!("🚀 CUDA execution provider is available and will be used");
            providers.push(cuda_provider.build());
        }
        let coreml_provider = CoreMLExecutionProvider::default();
        if OrtExecutionProvider::is_available(&coreml_provider).unwrap_or(false) {
            log::info!("🍎 CoreML execution provider is available and will be used");
            providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
        }
        if providers.is_empty() {
            log::info!("Using CPU execution provider");
        } else {
            session_builder = session_builder
                .with_execution_providers(providers)
                .map_err(|e| PipelineError::model(format!("Failed to set execution providers: {e}")))?;
        }

        let intra_threads = if constraints.intra_threads > 0 {
            constraints.intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(4)
        };

        let session = session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| PipelineError::model(format!("Failed to set intra threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| PipelineError::model(format!("Failed to create session from model data: {e}")))?;

        self.session = Some(session);

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "📊 ONNX model {} loaded in {}ms ({intra_threads} intra-op threads)",
            self.model_name,
            model_load_time.as_millis()
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self, constraints: &ProcessingConstraints) -> Result<Option<Duration>> {
        if self.session.is_some() {
            return Ok(None);
        }
        self.load_model(constraints).map(Some)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| PipelineError::inference("ONNX session not initialized"))?;

        let inference_start = Instant::now();
        let input_value = Value::from_array(input.clone())
            .map_err(|e| PipelineError::inference(format!("Failed to convert input tensor: {e}")))?;

        // Positional inputs avoid depending on tensor names
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| PipelineError::inference(format!("ONNX inference failed: {e}")))?;

        let output_tensor = {
            let keys: Vec<_> = outputs.keys().collect();
            let first_key = keys
                .first()
                .ok_or_else(|| PipelineError::inference("No output tensors found"))?;
            outputs
                .get(first_key)
                .ok_or_else(|| PipelineError::inference("First output tensor not found"))?
                .try_extract_array::<f32>()
                .map_err(|e| PipelineError::inference(format!("Failed to extract output tensor: {e}")))?
        };

        let shape = output_tensor.shape().to_vec();
        let output = reshape_mask_output(&shape, output_tensor.iter().copied().collect())?;

        log::debug!(
            "📊 ONNX inference complete: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
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
            backend: "onnx".to_string(),
            size_bytes: self.model_size,
            input_shape: (1, 3, size, size),
            output_shape: (1, 1, size, size),
        }
    }

    fn is_initialized(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(all(test, feature = "onnx"))]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::ErrorKind;

    #[test]
    fn test_onnx_backend_creation() {
        let backend = OnnxBackend::new(&PipelineConfig::default().processing);
        assert!(!backend.is_initialized());
        assert_eq!(backend.model_info().backend, "onnx");
    }

    #[test]
    fn test_missing_model_is_load_failure() {
        let mut constraints = PipelineConfig::default().processing;
        constraints.model_path = Some("/nonexistent/model.onnx".into());
        let mut backend = OnnxBackend::new(&constraints);
        let err = backend.initialize(&constraints).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelLoadFailed);
    }

    #[test]
    fn test_cpu_provider_always_listed() {
        let providers = OnnxBackend::list_providers();
        assert!(providers.iter().any(|(name, available)| name == "CPU" && *available));
    }
}
