//! Error types for the background removal pipeline
//!
//! Every failure a task can run into is classified here. The classification
//! drives three decisions elsewhere in the crate: whether the segmentation
//! retry loop may try again (`is_retryable`), whether a batch must stop
//! scheduling new work (`is_global`), and what a user is told (`user_message`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Comprehensive error types for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Declared or detected MIME type is not in the allow-list
    #[error("Invalid type: {0}")]
    InvalidType(String),

    /// Input exceeds the configured byte ceiling
    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    /// Decoding, resizing or re-encoding failed
    #[error("Normalization failed: {0}")]
    NormalizationFailed(String),

    /// Model could not be created or initialized
    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    /// Model ran but produced no usable output
    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    /// Input cannot be segmented (undecodable image, wrong tensor shape, bad URL)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Alpha application or PNG encoding failed
    #[error("Composite failed: {0}")]
    CompositeFailed(String),

    /// Result cache cannot be read or written
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Remote image could not be fetched
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Work was abandoned because the owning task was cancelled or deleted
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// No task with the given id exists in the session
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Operation not allowed in the task's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A reference was released twice
    #[error("Resource already released: {0}")]
    AlreadyReleased(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable discriminant of [`PipelineError`], carried in task and batch reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidType,
    TooLarge,
    NormalizationFailed,
    ModelLoadFailed,
    InferenceFailed,
    InvalidInput,
    CompositeFailed,
    CacheUnavailable,
    FetchFailed,
    Cancelled,
    UnknownTask,
    InvalidState,
    InvalidConfig,
    AlreadyReleased,
    Io,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl PipelineError {
    /// Create a new invalid type error
    pub fn invalid_type<S: Into<String>>(msg: S) -> Self {
        Self::InvalidType(msg.into())
    }

    /// Create a new normalization error
    pub fn normalization<S: Into<String>>(msg: S) -> Self {
        Self::NormalizationFailed(msg.into())
    }

    /// Create a new model load error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoadFailed(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::InferenceFailed(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new compositing error
    pub fn composite<S: Into<String>>(msg: S) -> Self {
        Self::CompositeFailed(msg.into())
    }

    /// Create a new cache error
    pub fn cache<S: Into<String>>(msg: S) -> Self {
        Self::CacheUnavailable(msg.into())
    }

    /// Create a new fetch error
    pub fn fetch<S: Into<String>>(msg: S) -> Self {
        Self::FetchFailed(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: fmt::Display>(parameter: &str, value: T, valid_range: &str) -> Self {
        Self::InvalidConfig(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range})"
        ))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Discriminant of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidType(_) => ErrorKind::InvalidType,
            Self::TooLarge { .. } => ErrorKind::TooLarge,
            Self::NormalizationFailed(_) => ErrorKind::NormalizationFailed,
            Self::ModelLoadFailed(_) => ErrorKind::ModelLoadFailed,
            Self::InferenceFailed(_) => ErrorKind::InferenceFailed,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::CompositeFailed(_) => ErrorKind::CompositeFailed,
            Self::CacheUnavailable(_) => ErrorKind::CacheUnavailable,
            Self::FetchFailed(_) => ErrorKind::FetchFailed,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::UnknownTask(_) => ErrorKind::UnknownTask,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::AlreadyReleased(_) => ErrorKind::AlreadyReleased,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the segmentation retry loop may attempt the operation again
    ///
    /// Only transient inference failures qualify. Model load failures are
    /// sticky until the engine is reset and everything else is deterministic.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InferenceFailed(_))
    }

    /// Whether the error affects every task rather than the one that hit it
    #[must_use]
    pub fn is_global(&self) -> bool {
        matches!(self, Self::ModelLoadFailed(_))
    }

    /// Short human-readable reason suitable for display next to a failed item
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidType(_) => "Unsupported file type. Please use JPEG, PNG or WebP.".to_string(),
            Self::TooLarge { limit, .. } => format!(
                "File is too large. Maximum size is {:.1} MB.",
                *limit as f64 / (1024.0 * 1024.0)
            ),
            Self::NormalizationFailed(_) => "The image could not be prepared for processing.".to_string(),
            Self::ModelLoadFailed(_) => "The segmentation model could not be loaded.".to_string(),
            Self::InferenceFailed(_) => "Background removal failed. Please try again.".to_string(),
            Self::InvalidInput(msg) => format!("Invalid input: {msg}"),
            Self::CompositeFailed(_) => "The result image could not be created.".to_string(),
            Self::CacheUnavailable(_) => "Result cache is unavailable.".to_string(),
            Self::FetchFailed(_) => "The image could not be downloaded.".to_string(),
            Self::Cancelled(_) => "Processing was cancelled.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(error: image::ImageError) -> Self {
        Self::NormalizationFailed(error.to_string())
    }
}
