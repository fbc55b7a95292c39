//! Core types for the background removal pipeline

use crate::cache::Fingerprint;
use crate::config::{NormalizedFormat, OutputFormat};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::lifecycle::ObjectUrl;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageBuffer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Identifier of one image task within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Where an image came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    /// Single file picked or dropped by the user
    LocalFile,
    /// Image fetched from a remote URL
    RemoteUrl { url: String },
    /// Member of a multi-image upload
    BatchMember { index: usize },
}

/// Task lifecycle
///
/// `Pending → Normalizing → Segmenting → Compositing → Completed`, with
/// `Failed` reachable from any non-terminal state. Only a retry leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Normalizing,
    Segmenting,
    Compositing,
    Completed,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Normalizing => 1,
            Self::Segmenting => 2,
            Self::Compositing => 3,
            Self::Completed => 4,
            Self::Failed => 5,
        }
    }

    /// Whether the task has finished, successfully or not
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving to `next` respects the forward-only ordering
    ///
    /// Forward skips are allowed (a cache hit goes straight from
    /// `Normalizing` to `Completed`).
    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Normalizing => "normalizing",
            Self::Segmenting => "segmenting",
            Self::Compositing => "compositing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Error descriptor attached to a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    /// Human-readable reason
    pub reason: String,
    /// Technical detail for logs
    pub detail: String,
    pub retryable: bool,
    pub at: DateTime<Utc>,
}

impl From<&PipelineError> for TaskError {
    fn from(error: &PipelineError) -> Self {
        Self {
            kind: error.kind(),
            reason: error.user_message(),
            detail: error.to_string(),
            retryable: error.is_retryable(),
            at: Utc::now(),
        }
    }
}

/// Downscaled, re-encoded rendition of an input image
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: NormalizedFormat,
    /// Dimensions of the image before normalization
    pub source_dimensions: (u32, u32),
}

impl NormalizedImage {
    /// Decode the normalized bytes
    ///
    /// # Errors
    /// - The buffer is not a decodable image
    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory(&self.bytes).map_err(|e| {
            PipelineError::invalid_input(format!("Normalized image cannot be decoded: {e}"))
        })
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Per-pixel foreground confidence as 8-bit grayscale
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    /// Mask data as grayscale values (0-255), row major
    pub data: Vec<u8>,

    /// Mask dimensions (width, height)
    pub dimensions: (u32, u32),
}

impl SegmentationMask {
    /// Create a new segmentation mask
    #[must_use]
    pub fn new(data: Vec<u8>, dimensions: (u32, u32)) -> Self {
        Self { data, dimensions }
    }

    /// Create mask from a grayscale image
    #[must_use]
    pub fn from_image(image: &ImageBuffer<image::Luma<u8>, Vec<u8>>) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.as_raw().clone(), (width, height))
    }

    /// Convert mask to a grayscale image
    ///
    /// # Errors
    /// - Data length does not match the dimensions
    pub fn to_image(&self) -> Result<ImageBuffer<image::Luma<u8>, Vec<u8>>> {
        let (width, height) = self.dimensions;
        ImageBuffer::from_raw(width, height, self.data.clone()).ok_or_else(|| {
            PipelineError::composite("Mask data length does not match its dimensions")
        })
    }

    /// Resize the mask to new dimensions
    ///
    /// # Errors
    /// - Mask data is inconsistent with its dimensions
    pub fn resize(&self, new_width: u32, new_height: u32) -> Result<SegmentationMask> {
        let current_image = self.to_image()?;
        let resized = image::imageops::resize(
            &current_image,
            new_width,
            new_height,
            image::imageops::FilterType::Lanczos3,
        );
        Ok(SegmentationMask::from_image(&resized))
    }

    /// Get mask statistics
    #[must_use]
    pub fn statistics(&self) -> MaskStatistics {
        let total_pixels = self.data.len();
        let foreground_pixels = self.data.iter().filter(|&&x| x > 127).count();
        let background_pixels = total_pixels - foreground_pixels;
        let ratio = |count: usize| {
            if total_pixels == 0 {
                0.0
            } else {
                count as f32 / total_pixels as f32
            }
        };

        MaskStatistics {
            total_pixels,
            foreground_pixels,
            background_pixels,
            foreground_ratio: ratio(foreground_pixels),
            background_ratio: ratio(background_pixels),
        }
    }
}

/// Statistics about a segmentation mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskStatistics {
    pub total_pixels: usize,
    pub foreground_pixels: usize,
    pub background_pixels: usize,
    pub foreground_ratio: f32,
    pub background_ratio: f32,
}

/// Encoded result of compositing a mask onto an image
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
}

/// Final transparent image owned by a task
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedOutput {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    /// Fingerprint of the processing rendition this output was derived from
    pub fingerprint: Fingerprint,
    /// Served from the result cache without running the model
    pub from_cache: bool,
    /// Revocable display reference for the output
    pub url: Option<ObjectUrl>,
}

impl ProcessedOutput {
    /// Build a task-owned output from a composite
    #[must_use]
    pub fn from_composite(composite: CompositeImage, fingerprint: Fingerprint, from_cache: bool) -> Self {
        Self {
            bytes: composite.bytes,
            width: composite.width,
            height: composite.height,
            format: composite.format,
            fingerprint,
            from_cache,
            url: None,
        }
    }
}

/// Detailed timing breakdown for one processing attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Model creation time (only when the model was cold)
    pub model_load_ms: u64,
    /// Preview and processing normalization
    pub normalize_ms: u64,
    /// Segmentation including retries and backoff
    pub segment_ms: u64,
    /// Alpha application and encoding
    pub composite_ms: u64,
    /// Total end-to-end processing time
    pub total_ms: u64,
    /// Segmentation attempts used (0 on a cache hit)
    pub segmentation_attempts: u32,
    pub cache_hit: bool,
}

/// Result file handed to the user
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime_type: &'static str,
}

/// Download name for a processed image: `<stem>_processed.<ext>`
#[must_use]
pub fn processed_filename(original_name: &str, format: OutputFormat) -> String {
    let stem = Path::new(original_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");
    format!("{stem}_processed.{}", format.extension())
}

/// One unit of work flowing through the pipeline
#[derive(Debug)]
pub struct ImageTask {
    pub id: TaskId,
    pub source: ImageSource,
    /// Original file name
    pub name: String,
    /// Declared or sniffed MIME type
    pub mime_type: String,
    /// Original bytes, shared only with this task's display reference
    pub original: Arc<Vec<u8>>,
    pub display_url: Option<ObjectUrl>,
    pub preview: Option<NormalizedImage>,
    pub preview_url: Option<ObjectUrl>,
    pub normalized: Option<NormalizedImage>,
    pub fingerprint: Option<Fingerprint>,
    pub mask: Option<SegmentationMask>,
    pub output: Option<ProcessedOutput>,
    pub attempt: u32,
    pub retry_count: u32,
    pub error: Option<TaskError>,
    pub timings: ProcessingTimings,
    pub created_at: DateTime<Utc>,
    status: TaskStatus,
    progress: u8,
}

impl ImageTask {
    /// Create a pending task
    #[must_use]
    pub fn new(
        id: TaskId,
        source: ImageSource,
        name: String,
        mime_type: String,
        original: Arc<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            source,
            name,
            mime_type,
            original,
            display_url: None,
            preview: None,
            preview_url: None,
            normalized: None,
            fingerprint: None,
            mask: None,
            output: None,
            attempt: 1,
            retry_count: 0,
            error: None,
            timings: ProcessingTimings::default(),
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            progress: 0,
        }
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Progress of the current attempt (0-100)
    #[must_use]
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Move to the next status
    ///
    /// # Errors
    /// - The move would go backwards or leave a terminal state
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::invalid_state(format!(
                "{} cannot move from {} to {next}",
                self.id, self.status
            )));
        }
        log::trace!("{}: {} -> {next}", self.id, self.status);
        self.status = next;
        if next == TaskStatus::Completed {
            self.progress = 100;
        }
        Ok(())
    }

    /// Record progress; values below the current one are ignored
    pub fn set_progress(&mut self, percentage: u8) {
        self.progress = self.progress.max(percentage.min(100));
    }

    /// Mark the task failed with a classified error
    ///
    /// Terminal tasks are left untouched.
    pub fn fail(&mut self, error: &PipelineError) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(TaskError::from(error));
    }

    /// Reset a finished task for another attempt
    ///
    /// Progress returns to 0 and the attempt counter advances. The
    /// normalized rendition is kept; mask and output are dropped.
    ///
    /// # Errors
    /// - The task has not finished yet
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if !self.status.is_terminal() {
            return Err(PipelineError::invalid_state(format!(
                "{} is {} and cannot be retried",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.attempt += 1;
        self.retry_count += 1;
        self.error = None;
        self.mask = None;
        self.output = None;
        self.timings = ProcessingTimings::default();
        Ok(())
    }

    /// Read-only view for consumers
    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            source: self.source.clone(),
            status: self.status,
            progress: self.progress,
            attempt: self.attempt,
            retry_count: self.retry_count,
            error: self.error.clone(),
            has_output: self.output.is_some(),
        }
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub source: ImageSource,
    pub status: TaskStatus,
    pub progress: u8,
    pub attempt: u32,
    pub retry_count: u32,
    pub error: Option<TaskError>,
    pub has_output: bool,
}
