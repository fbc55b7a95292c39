//! Configuration types for the background removal pipeline
//!
//! All static constraints are grouped here and loaded once at startup, either
//! from defaults, a JSON file, or the builder. Nothing in the pipeline mutates
//! a [`PipelineConfig`] after construction.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at a JSON configuration file
pub const CONFIG_ENV_VAR: &str = "BGREMOVE_PIPELINE_CONFIG";

/// Environment variable overriding the model directory
pub const MODEL_DIR_ENV_VAR: &str = "BGREMOVE_PIPELINE_MODEL_DIR";

const MIB: usize = 1024 * 1024;

/// Inference backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Tract backend (pure Rust, no external dependencies)
    Tract,
    /// ONNX Runtime backend (supports GPU acceleration)
    Onnx,
}

impl Default for BackendType {
    fn default() -> Self {
        if cfg!(feature = "tract") || !cfg!(feature = "onnx") {
            Self::Tract
        } else {
            Self::Onnx
        }
    }
}

/// Encoding of the final composited image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG with alpha channel
    #[default]
    Png,
    /// Lossless WebP with alpha channel
    #[serde(rename = "webp")]
    WebP,
}

impl OutputFormat {
    /// File extension without the dot
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }

    /// MIME type of the encoded output
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }
}

/// Encoding used for normalized intermediate buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizedFormat {
    /// Lossy JPEG at the profile quality
    Jpeg,
    /// Lossless PNG; quality is ignored
    Png,
}

impl NormalizedFormat {
    /// MIME type of the normalized buffer
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

/// Meaning of the values produced by the segmentation model
///
/// Matting models such as `ISNet` emit foreground confidence, so
/// `Foreground` maps a mask value straight to alpha. `Background` treats the
/// mask as background confidence and computes `alpha = (1 - mask) * 255`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskConvention {
    /// Mask is foreground confidence: `alpha = mask`
    #[default]
    Foreground,
    /// Mask is background confidence: `alpha = 255 - mask`
    Background,
}

impl MaskConvention {
    /// Alpha value for a single 8-bit mask sample
    #[must_use]
    #[inline]
    pub fn alpha(self, mask: u8) -> u8 {
        match self {
            Self::Foreground => mask,
            Self::Background => 255 - mask,
        }
    }
}

/// Limits enforced when an image enters the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConstraints {
    /// Maximum accepted byte size of a single image
    pub max_bytes: usize,
    /// Display width bound; no rendition exceeds the longer display bound
    pub max_width: u32,
    /// Display height bound
    pub max_height: u32,
    /// Allowed MIME types
    pub allowed_types: Vec<String>,
}

impl Default for UploadConstraints {
    fn default() -> Self {
        Self {
            max_bytes: 10 * MIB,
            max_width: 1920,
            max_height: 1080,
            allowed_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
            ],
        }
    }
}

impl UploadConstraints {
    /// Whether a (normalized) MIME type is in the allow-list
    #[must_use]
    pub fn allows(&self, mime_type: &str) -> bool {
        self.allowed_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime_type))
    }
}

/// One downscale/re-encode profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationProfile {
    /// Longest edge after normalization (images are never upscaled)
    pub max_dimension: u32,
    /// Soft byte ceiling for the encoded result
    pub max_bytes: usize,
    /// Initial encoder quality (1-100)
    pub quality: u8,
    /// Encoding of the normalized buffer
    pub format: NormalizedFormat,
}

impl NormalizationProfile {
    /// Small, lower quality rendition used for on-screen previews
    #[must_use]
    pub fn preview() -> Self {
        Self {
            max_dimension: 256,
            max_bytes: 200 * 1024,
            quality: 60,
            format: NormalizedFormat::Jpeg,
        }
    }

    /// Rendition fed to the segmentation model
    #[must_use]
    pub fn processing() -> Self {
        Self {
            max_dimension: 512,
            max_bytes: 800 * 1024,
            quality: 80,
            format: NormalizedFormat::Jpeg,
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max_dimension == 0 {
            return Err(PipelineError::config_value_error(
                &format!("{name} max dimension"),
                self.max_dimension,
                "1-65535",
            ));
        }
        if self.quality == 0 || self.quality > 100 {
            return Err(PipelineError::config_value_error(
                &format!("{name} quality"),
                self.quality,
                "1-100",
            ));
        }
        if self.max_bytes == 0 {
            return Err(PipelineError::config_value_error(
                &format!("{name} max bytes"),
                self.max_bytes,
                "> 0",
            ));
        }
        Ok(())
    }
}

/// Both normalization profiles plus offload policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConstraints {
    pub preview: NormalizationProfile,
    pub processing: NormalizationProfile,
    /// Inputs at or above this size are normalized on a blocking worker
    pub offload_threshold_bytes: usize,
}

impl Default for NormalizationConstraints {
    fn default() -> Self {
        Self {
            preview: NormalizationProfile::preview(),
            processing: NormalizationProfile::processing(),
            offload_threshold_bytes: MIB,
        }
    }
}

/// Model and output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConstraints {
    /// Model identifier, also the file stem inside the model directory
    pub model_name: String,
    /// Explicit model file, overrides directory resolution
    pub model_path: Option<PathBuf>,
    pub backend: BackendType,
    pub output_format: OutputFormat,
    /// Output encoder quality; PNG and lossless WebP ignore it
    pub output_quality: u8,
    pub mask_convention: MaskConvention,
    /// Square model input edge in pixels
    pub input_size: u32,
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
    /// Elapsed time after which a task is reported as slow (never aborted)
    pub soft_timeout_secs: u64,
    /// Additional segmentation attempts after a retryable failure
    pub max_retries: u32,
    /// Linear backoff unit between segmentation attempts
    pub retry_backoff_ms: u64,
    /// User-initiated retries allowed per task
    pub max_task_retries: u32,
    /// Idle period after which the model is released
    pub model_idle_secs: u64,
    /// Backend intra-op threads (0 = backend default)
    pub intra_threads: usize,
    /// Pixels processed between yields while compositing
    pub composite_chunk_pixels: usize,
}

impl Default for ProcessingConstraints {
    fn default() -> Self {
        Self {
            model_name: "isnet".to_string(),
            model_path: None,
            backend: BackendType::default(),
            output_format: OutputFormat::Png,
            output_quality: 90,
            mask_convention: MaskConvention::Foreground,
            input_size: 1024,
            normalization_mean: [0.5, 0.5, 0.5],
            normalization_std: [1.0, 1.0, 1.0],
            soft_timeout_secs: 20,
            max_retries: 2,
            retry_backoff_ms: 1000,
            max_task_retries: 3,
            model_idle_secs: 30 * 60,
            intra_threads: 0,
            composite_chunk_pixels: 10_000,
        }
    }
}

impl ProcessingConstraints {
    #[must_use]
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn model_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.model_idle_secs)
    }

    /// Resolve the model file location
    ///
    /// Order: explicit `model_path`, then `$BGREMOVE_PIPELINE_MODEL_DIR`, then
    /// the user cache directory.
    #[must_use]
    pub fn resolve_model_path(&self) -> PathBuf {
        if let Some(path) = &self.model_path {
            return path.clone();
        }
        let file_name = format!("{}.onnx", self.model_name);
        if let Ok(dir) = std::env::var(MODEL_DIR_ENV_VAR) {
            return PathBuf::from(dir).join(file_name);
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bgremove-pipeline")
            .join("models")
            .join(file_name)
    }
}

/// Batch partitioning and concurrency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConstraints {
    pub batch_size: usize,
    pub max_concurrent: usize,
}

impl Default for BatchConstraints {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_concurrent: 3,
        }
    }
}

/// Result cache behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConstraints {
    pub enabled: bool,
    /// Entry lifetime, measured from the last write
    pub ttl_secs: u64,
    /// Period of the background sweeper
    pub sweep_interval_secs: u64,
}

impl Default for CacheConstraints {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConstraints {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Complete static configuration of the pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub upload: UploadConstraints,
    pub normalization: NormalizationConstraints,
    pub processing: ProcessingConstraints,
    pub batch: BatchConstraints,
    pub cache: CacheConstraints,
}

impl PipelineConfig {
    /// Create a builder for configuring the pipeline
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    /// - Malformed JSON
    /// - Any value rejected by [`PipelineConfig::validate`]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::invalid_config(format!("Malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    ///
    /// # Errors
    /// - File cannot be read
    /// - Malformed or invalid configuration
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::file_io_error("read configuration", path, &e))?;
        Self::from_json_str(&json)
    }

    /// Load configuration once at startup
    ///
    /// Uses `path` when given, otherwise the file named by
    /// `BGREMOVE_PIPELINE_CONFIG`, otherwise the defaults.
    ///
    /// # Errors
    /// - Configuration file cannot be read or is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_json_file(path);
        }
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(env_path) if !env_path.is_empty() => {
                log::debug!("Loading configuration from ${CONFIG_ENV_VAR}: {env_path}");
                Self::from_json_file(env_path)
            },
            _ => Ok(Self::default()),
        }
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Zero sizes, limits or concurrency
    /// - Qualities outside 1-100
    /// - Empty MIME allow-list or model name
    pub fn validate(&self) -> Result<()> {
        if self.upload.max_bytes == 0 {
            return Err(PipelineError::config_value_error(
                "upload max bytes",
                self.upload.max_bytes,
                "> 0",
            ));
        }
        if self.upload.max_width == 0 || self.upload.max_height == 0 {
            return Err(PipelineError::invalid_config(
                "Upload width and height bounds must be positive",
            ));
        }
        if self.upload.allowed_types.is_empty() {
            return Err(PipelineError::invalid_config(
                "At least one allowed MIME type is required",
            ));
        }
        self.normalization.preview.validate("preview")?;
        self.normalization.processing.validate("processing")?;
        let display_bound = self.upload.max_width.max(self.upload.max_height);
        for (name, profile) in [
            ("preview", &self.normalization.preview),
            ("processing", &self.normalization.processing),
        ] {
            if profile.max_dimension > display_bound {
                return Err(PipelineError::config_value_error(
                    &format!("{name} max dimension"),
                    profile.max_dimension,
                    &format!("1-{display_bound}"),
                ));
            }
        }

        let processing = &self.processing;
        if processing.model_name.trim().is_empty() {
            return Err(PipelineError::invalid_config("Model name must not be empty"));
        }
        if processing.output_quality > 100 {
            return Err(PipelineError::config_value_error(
                "output quality",
                processing.output_quality,
                "0-100",
            ));
        }
        if processing.input_size == 0 {
            return Err(PipelineError::config_value_error(
                "model input size",
                processing.input_size,
                "> 0",
            ));
        }
        if processing.normalization_std.iter().any(|s| *s <= 0.0) {
            return Err(PipelineError::invalid_config(
                "Normalization std values must be positive",
            ));
        }
        if processing.composite_chunk_pixels == 0 {
            return Err(PipelineError::config_value_error(
                "composite chunk pixels",
                processing.composite_chunk_pixels,
                "> 0",
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(PipelineError::config_value_error(
                "batch size",
                self.batch.batch_size,
                "> 0",
            ));
        }
        if self.batch.max_concurrent == 0 {
            return Err(PipelineError::config_value_error(
                "max concurrent",
                self.batch.max_concurrent,
                "> 0",
            ));
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            return Err(PipelineError::config_value_error(
                "cache TTL seconds",
                self.cache.ttl_secs,
                "> 0",
            ));
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`]
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Start from an existing configuration
    #[must_use]
    pub fn from_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Set the upload byte ceiling
    #[must_use]
    pub fn max_upload_bytes(mut self, max_bytes: usize) -> Self {
        self.config.upload.max_bytes = max_bytes;
        self
    }

    /// Replace the MIME allow-list
    #[must_use]
    pub fn allowed_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.upload.allowed_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the preview normalization profile
    #[must_use]
    pub fn preview_profile(mut self, profile: NormalizationProfile) -> Self {
        self.config.normalization.preview = profile;
        self
    }

    /// Set the processing normalization profile
    #[must_use]
    pub fn processing_profile(mut self, profile: NormalizationProfile) -> Self {
        self.config.normalization.processing = profile;
        self
    }

    /// Set the longest edge of the processing rendition
    #[must_use]
    pub fn max_dimension(mut self, max_dimension: u32) -> Self {
        self.config.normalization.processing.max_dimension = max_dimension;
        self
    }

    /// Set the blocking-worker offload threshold
    #[must_use]
    pub fn offload_threshold_bytes(mut self, bytes: usize) -> Self {
        self.config.normalization.offload_threshold_bytes = bytes;
        self
    }

    /// Set the model name
    #[must_use]
    pub fn model_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.processing.model_name = name.into();
        self
    }

    /// Set an explicit model file
    #[must_use]
    pub fn model_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.processing.model_path = Some(path.into());
        self
    }

    /// Set the inference backend
    #[must_use]
    pub fn backend(mut self, backend: BackendType) -> Self {
        self.config.processing.backend = backend;
        self
    }

    /// Set the output format
    #[must_use]
    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.processing.output_format = format;
        self
    }

    /// Set how mask values map to alpha
    #[must_use]
    pub fn mask_convention(mut self, convention: MaskConvention) -> Self {
        self.config.processing.mask_convention = convention;
        self
    }

    /// Set the model input edge
    #[must_use]
    pub fn input_size(mut self, size: u32) -> Self {
        self.config.processing.input_size = size;
        self
    }

    /// Set the soft timeout in seconds
    #[must_use]
    pub fn soft_timeout_secs(mut self, secs: u64) -> Self {
        self.config.processing.soft_timeout_secs = secs;
        self
    }

    /// Set retry count and backoff unit for segmentation
    #[must_use]
    pub fn retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.config.processing.max_retries = max_retries;
        self.config.processing.retry_backoff_ms = backoff_ms;
        self
    }

    /// Set the number of user-initiated retries per task
    #[must_use]
    pub fn max_task_retries(mut self, retries: u32) -> Self {
        self.config.processing.max_task_retries = retries;
        self
    }

    /// Set the model idle timeout in seconds
    #[must_use]
    pub fn model_idle_secs(mut self, secs: u64) -> Self {
        self.config.processing.model_idle_secs = secs;
        self
    }

    /// Set backend intra-op threads
    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.processing.intra_threads = threads;
        self
    }

    /// Set compositor chunk size
    #[must_use]
    pub fn composite_chunk_pixels(mut self, pixels: usize) -> Self {
        self.config.processing.composite_chunk_pixels = pixels;
        self
    }

    /// Set batch size
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch.batch_size = size;
        self
    }

    /// Set normalization concurrency within a batch
    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.batch.max_concurrent = max;
        self
    }

    /// Enable or disable the result cache
    #[must_use]
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    /// Set cache TTL in seconds
    #[must_use]
    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache.ttl_secs = secs;
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// - Any value rejected by [`PipelineConfig::validate`]
    pub fn build(self) -> Result<PipelineConfig> {
        let config = self.config;
        config.validate()?;
        Ok(config)
    }
}
