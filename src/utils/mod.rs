//! Utility modules shared across the pipeline

pub mod mime;
pub mod preprocessing;
pub mod retry;
pub mod yielding;

pub use mime::{canonical_mime, detect_image_format, mime_from_extension};
pub use preprocessing::{tensor_to_mask, ImagePreprocessor, LetterboxTransform, MaskExtractor, PreprocessingConfig};
pub use retry::{RetryOutcome, RetryPolicy};
pub use yielding::YieldingWorkLoop;
