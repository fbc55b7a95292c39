//! Image normalization
//!
//! Produces bounded, re-encoded renditions of an input image. The preview
//! profile feeds the on-screen thumbnail and the processing profile feeds the
//! segmentation model; the two never share a buffer.

use crate::{
    config::{NormalizationConstraints, NormalizationProfile, NormalizedFormat},
    error::{PipelineError, Result},
    services::OutputFormatHandler,
    types::NormalizedImage,
};
use image::{imageops::FilterType, DynamicImage};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// Lowest JPEG quality tried before the dimensions are reduced
const MIN_QUALITY: u8 = 40;
/// Quality decrement per size-reduction step
const QUALITY_STEP: u8 = 10;
/// Upper bound on encode attempts per rendition
const MAX_ENCODE_ATTEMPTS: usize = 16;

/// Which rendition to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    Preview,
    Processing,
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preview => write!(f, "preview"),
            Self::Processing => write!(f, "processing"),
        }
    }
}

/// Snapshot of normalizer activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    /// Normalizations currently running
    pub in_flight: usize,
    /// Highest number of simultaneous normalizations observed
    pub peak_in_flight: usize,
    /// Normalizations finished (successfully or not)
    pub completed: u64,
    /// Normalizations that ran on a blocking worker
    pub offloaded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicU64,
    offloaded: AtomicU64,
}

/// Tracks one in-flight normalization
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
        self.0.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Downscales and re-encodes images according to the configured profiles
#[derive(Debug)]
pub struct Normalizer {
    constraints: NormalizationConstraints,
    counters: Counters,
    permits: Option<Semaphore>,
}

impl Normalizer {
    /// Normalizer with no cap on simultaneous normalizations
    #[must_use]
    pub fn new(constraints: NormalizationConstraints) -> Self {
        Self {
            constraints,
            counters: Counters::default(),
            permits: None,
        }
    }

    /// Normalizer that runs at most `limit` normalizations at once
    ///
    /// Callers past the limit wait for a slot before decoding starts, so the
    /// cap holds across renditions of one image as well as across images.
    #[must_use]
    pub fn with_limit(constraints: NormalizationConstraints, limit: usize) -> Self {
        Self {
            permits: Some(Semaphore::new(limit.max(1))),
            ..Self::new(constraints)
        }
    }

    /// Profile used for `kind`
    #[must_use]
    pub fn profile(&self, kind: ProfileKind) -> &NormalizationProfile {
        match kind {
            ProfileKind::Preview => &self.constraints.preview,
            ProfileKind::Processing => &self.constraints.processing,
        }
    }

    #[must_use]
    pub fn stats(&self) -> NormalizerStats {
        NormalizerStats {
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            offloaded: self.counters.offloaded.load(Ordering::SeqCst),
        }
    }

    /// Produce the `kind` rendition of an encoded image
    ///
    /// Buffers at or above the offload threshold are processed on a blocking
    /// worker so large decodes never stall the runtime.
    ///
    /// # Errors
    /// - `NormalizationFailed` when the input cannot be decoded or encoded
    #[instrument(skip(self, bytes), fields(kind = %kind, input_bytes = bytes.len()))]
    pub async fn normalize(&self, bytes: Arc<Vec<u8>>, kind: ProfileKind) -> Result<NormalizedImage> {
        let _permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::normalization("Normalizer is closed"))?,
            ),
            None => None,
        };
        let _guard = InFlightGuard::enter(&self.counters);
        let profile = self.profile(kind).clone();

        if bytes.len() >= self.constraints.offload_threshold_bytes {
            self.counters.offloaded.fetch_add(1, Ordering::SeqCst);
            tokio::task::spawn_blocking(move || normalize_bytes(&bytes, &profile))
                .await
                .map_err(|e| PipelineError::normalization(format!("Normalization worker failed: {e}")))?
        } else {
            normalize_bytes(&bytes, &profile)
        }
    }
}

/// Synchronous normalization of an encoded image
///
/// # Errors
/// - `NormalizationFailed` when the input cannot be decoded or encoded
pub fn normalize_bytes(bytes: &[u8], profile: &NormalizationProfile) -> Result<NormalizedImage> {
    let source = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::normalization(format!("Failed to decode image: {e}")))?;
    normalize_image(&source, profile)
}

/// Synchronous normalization of a decoded image
///
/// # Errors
/// - `NormalizationFailed` for empty images or encoder failures
pub fn normalize_image(source: &DynamicImage, profile: &NormalizationProfile) -> Result<NormalizedImage> {
    let source_dimensions = (source.width(), source.height());
    if source_dimensions.0 == 0 || source_dimensions.1 == 0 {
        return Err(PipelineError::normalization("Image has no pixels"));
    }

    let (mut width, mut height) = fit_within(source_dimensions, profile.max_dimension);
    let mut quality = profile.quality;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let resized = if (width, height) == source_dimensions {
            source.clone()
        } else {
            source.resize_exact(width, height, FilterType::Lanczos3)
        };
        let encoded = OutputFormatHandler::encode_normalized(&resized, profile.format, quality)?;

        let fits = encoded.len() <= profile.max_bytes;
        let exhausted = attempts >= MAX_ENCODE_ATTEMPTS || (width == 1 && height == 1);
        if fits || exhausted {
            if !fits {
                warn!(
                    encoded_bytes = encoded.len(),
                    max_bytes = profile.max_bytes,
                    attempts,
                    "normalized image still above byte ceiling"
                );
            }
            debug!(
                width,
                height,
                quality,
                encoded_bytes = encoded.len(),
                attempts,
                "normalized image"
            );
            return Ok(NormalizedImage {
                bytes: encoded,
                width,
                height,
                format: profile.format,
                source_dimensions,
            });
        }

        if profile.format == NormalizedFormat::Jpeg && quality > MIN_QUALITY {
            quality = quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY);
        } else {
            width = (width * 3 / 4).max(1);
            height = (height * 3 / 4).max(1);
        }
    }
}

/// Largest dimensions inside `max_dimension x max_dimension` with the same
/// aspect ratio, never larger than the source
#[must_use]
pub fn fit_within(dimensions: (u32, u32), max_dimension: u32) -> (u32, u32) {
    let (width, height) = dimensions;
    let longest = width.max(height);
    if longest <= max_dimension {
        return dimensions;
    }
    let scale = f64::from(max_dimension) / f64::from(longest);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, max_dimension);
    (scaled(width), scaled(height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            let v = x.wrapping_mul(2_654_435_761).wrapping_add(y.wrapping_mul(40_503));
            Rgb([(v >> 3) as u8, (v >> 11) as u8, (v >> 19) as u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(NormalizationConstraints::default())
    }

    #[test]
    fn test_fit_within_preserves_aspect_ratio() {
        assert_eq!(fit_within((2000, 1000), 512), (512, 256));
        assert_eq!(fit_within((1000, 2000), 512), (256, 512));
        assert_eq!(fit_within((300, 200), 512), (300, 200));
        assert_eq!(fit_within((10_000, 1), 512), (512, 1));
    }

    #[tokio::test]
    async fn test_processing_profile_bounds_dimensions() {
        let normalized = normalizer()
            .normalize(Arc::new(noisy_png(1200, 600)), ProfileKind::Processing)
            .await
            .unwrap();

        assert_eq!(normalized.dimensions(), (512, 256));
        assert_eq!(normalized.source_dimensions, (1200, 600));
        assert_eq!(normalized.format, NormalizedFormat::Jpeg);
        assert!(normalized.bytes.len() <= 800 * 1024);
        assert_eq!(normalized.decode().unwrap().width(), 512);
    }

    #[tokio::test]
    async fn test_small_images_are_not_upscaled() {
        let normalized = normalizer()
            .normalize(Arc::new(noisy_png(100, 40)), ProfileKind::Preview)
            .await
            .unwrap();
        assert_eq!(normalized.dimensions(), (100, 40));
    }

    #[tokio::test]
    async fn test_preview_and_processing_are_distinct() {
        let normalizer = normalizer();
        let bytes = Arc::new(noisy_png(800, 800));
        let preview = normalizer.normalize(Arc::clone(&bytes), ProfileKind::Preview).await.unwrap();
        let processing = normalizer.normalize(bytes, ProfileKind::Processing).await.unwrap();

        assert_eq!(preview.dimensions(), (256, 256));
        assert_eq!(processing.dimensions(), (512, 512));
        assert_ne!(preview.bytes, processing.bytes);
    }

    #[test]
    fn test_byte_ceiling_lowers_quality_then_dimensions() {
        let profile = NormalizationProfile {
            max_dimension: 256,
            max_bytes: 4 * 1024,
            quality: 90,
            format: NormalizedFormat::Jpeg,
        };
        let normalized = normalize_bytes(&noisy_png(256, 256), &profile).unwrap();

        assert!(normalized.bytes.len() <= 4 * 1024);
        assert!(normalized.width < 256);
        assert_eq!(normalized.width, normalized.height);
    }

    #[test]
    fn test_unreachable_ceiling_is_bounded() {
        let profile = NormalizationProfile {
            max_dimension: 64,
            max_bytes: 1,
            quality: 80,
            format: NormalizedFormat::Png,
        };
        let normalized = normalize_bytes(&noisy_png(64, 64), &profile).unwrap();
        assert!(normalized.width >= 1);
    }

    #[tokio::test]
    async fn test_undecodable_input_fails() {
        let err = normalizer()
            .normalize(Arc::new(b"\xFF\xD8\xFF garbage".to_vec()), ProfileKind::Processing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NormalizationFailed);
        assert_eq!(normalizer().stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_large_inputs_are_offloaded() {
        let mut constraints = NormalizationConstraints::default();
        constraints.offload_threshold_bytes = 1;
        let normalizer = Normalizer::new(constraints);

        normalizer
            .normalize(Arc::new(noisy_png(64, 64)), ProfileKind::Preview)
            .await
            .unwrap();

        let stats = normalizer.stats();
        assert_eq!(stats.offloaded, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.peak_in_flight, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limit_caps_simultaneous_normalizations() {
        let mut constraints = NormalizationConstraints::default();
        constraints.offload_threshold_bytes = 1;
        let normalizer = Arc::new(Normalizer::with_limit(constraints, 2));
        let input = Arc::new(noisy_png(800, 600));

        let mut handles = Vec::new();
        for i in 0..6 {
            let normalizer = Arc::clone(&normalizer);
            let input = Arc::clone(&input);
            let kind = if i % 2 == 0 { ProfileKind::Preview } else { ProfileKind::Processing };
            handles.push(tokio::spawn(async move { normalizer.normalize(input, kind).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stats = normalizer.stats();
        assert_eq!(stats.completed, 6);
        assert!(stats.peak_in_flight <= 2, "peak {} > 2", stats.peak_in_flight);
    }
}
